use std::{any::Any, fmt, sync::Arc};

use async_trait::async_trait;
use derive_more::Display;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

/// Where the outgoing video track comes from
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    #[default]
    #[display(fmt = "camera")]
    Camera,
    #[display(fmt = "screen share")]
    ScreenShare,
}

/// A single captured or received media track.
///
/// Implementations are shared between the local stream and every connection
/// sending it, so all methods take `&self`.
pub trait MediaTrack: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    fn enabled(&self) -> bool;

    /// A disabled track keeps its place in every connection but sends nothing
    fn set_enabled(&self, enabled: bool);

    /// Releases the underlying capture device. Stopping is permanent
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Resolves once the track has ended, either through [`MediaTrack::stop`]
    /// or because the source went away (eg the user closed a screen share
    /// from the operating system)
    fn ended(&self) -> BoxFuture<'static, ()>;

    /// Used by connection brokers to recover their own track type
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("enabled", &self.enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new(vec![])
    }
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn first_video_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.video_tracks().next().cloned()
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return;
        }
        self.tracks.push(track);
    }

    pub fn remove_track(&mut self, id: &str) -> Option<Arc<dyn MediaTrack>> {
        let index = self.tracks.iter().position(|t| t.id() == id)?;
        Some(self.tracks.remove(index))
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stops every track in the stream
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Which devices to request when capturing user media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl CaptureConstraints {
    pub fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

/// Access to the local capture devices
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Camera and/or microphone. A refused permission or missing device
    /// should surface as [`Error::CaptureDenied`]
    async fn user_media(&self, constraints: CaptureConstraints) -> Result<MediaStream, Error>;

    /// Screen or window capture, video only
    async fn display_media(&self) -> Result<MediaStream, Error>;
}

/// The local participant's outgoing media
#[derive(Debug, Clone)]
pub struct LocalMediaState {
    stream: MediaStream,
    video_enabled: bool,
    audio_enabled: bool,
    source_kind: TrackSource,
}

impl LocalMediaState {
    pub fn new(stream: MediaStream) -> Self {
        Self {
            stream,
            video_enabled: true,
            audio_enabled: true,
            source_kind: TrackSource::Camera,
        }
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn source_kind(&self) -> TrackSource {
        self.source_kind
    }

    pub fn video_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.stream.first_video_track()
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        for track in self.stream.video_tracks() {
            track.set_enabled(enabled);
        }
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        for track in self.stream.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Swaps every video track in the local stream for `track`. The replaced
    /// tracks are returned so the caller can stop them once nothing sends
    /// them anymore.
    pub fn replace_video_track(
        &mut self,
        track: Arc<dyn MediaTrack>,
        source: TrackSource,
    ) -> Vec<Arc<dyn MediaTrack>> {
        let previous = self
            .stream
            .video_tracks()
            .filter(|t| t.id() != track.id())
            .map(|t| t.id().to_string())
            .collect::<Vec<_>>();

        let removed = previous
            .iter()
            .filter_map(|id| self.stream.remove_track(id))
            .collect::<Vec<_>>();

        track.set_enabled(self.video_enabled);
        self.stream.add_track(track);
        self.source_kind = source;
        removed
    }

    /// Stops every local track
    pub fn release(&self) {
        self.stream.stop();
    }
}
