//! RTP-backed tracks.
//!
//! An [`RtpTrack`] is a local track whose packets are written by the
//! application (encoders are outside this crate). The same track can be
//! attached to every peer connection; writing a packet forwards it to all of
//! them. A [`RemoteTrack`] wraps what a peer sends us.

use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use huddle::{
    error::Error,
    mesh::{CaptureConstraints, MediaCapture, MediaStream, MediaTrack, TrackKind},
};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    rtp::packet::Packet,
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

pub fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "".to_owned(),
        rtcp_feedback: vec![],
    }
}

pub(crate) fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

pub struct RtpTrack {
    id: String,
    kind: TrackKind,
    local: Arc<TrackLocalStaticRTP>,
    enabled: AtomicBool,
    stopped: CancellationToken,
}

impl RtpTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        codec: RTCRtpCodecCapability,
        stream_id: &str,
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            local: Arc::new(TrackLocalStaticRTP::new(
                codec,
                id.clone(),
                stream_id.to_string(),
            )),
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: CancellationToken::new(),
        })
    }

    pub fn audio(stream_id: &str) -> Arc<Self> {
        Self::new(
            format!("audio-{}", Uuid::new_v4()),
            TrackKind::Audio,
            opus_capability(),
            stream_id,
        )
    }

    pub fn video(prefix: &str, stream_id: &str) -> Arc<Self> {
        Self::new(
            format!("{prefix}-{}", Uuid::new_v4()),
            TrackKind::Video,
            vp8_capability(),
            stream_id,
        )
    }

    /// The track handed to peer connections
    pub fn local(&self) -> Arc<TrackLocalStaticRTP> {
        self.local.clone()
    }

    /// Forwards `packet` to every connection the track is attached to.
    /// Packets written while the track is disabled or stopped are dropped
    pub async fn write_rtp(&self, packet: &Packet) -> anyhow::Result<()> {
        if self.is_stopped() || !self.enabled() {
            return Ok(());
        }
        self.local.write_rtp(packet).await?;
        Ok(())
    }

    /// Downcasts a track from a [`MediaStream`]
    pub fn from_track(track: &Arc<dyn MediaTrack>) -> Option<&RtpTrack> {
        track.as_any().downcast_ref::<RtpTrack>()
    }
}

impl MediaTrack for RtpTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    fn ended(&self) -> BoxFuture<'static, ()> {
        let token = self.stopped.clone();
        Box::pin(async move { token.cancelled().await })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Track received from a peer. Reading its packets is up to the render sink
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    remote: Arc<TrackRemote>,
    enabled: AtomicBool,
    ended: CancellationToken,
}

impl RemoteTrack {
    pub fn new(remote: Arc<TrackRemote>) -> Option<Arc<Self>> {
        let kind = track_kind(remote.kind())?;
        Some(Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            remote,
            enabled: AtomicBool::new(true),
            ended: CancellationToken::new(),
        }))
    }

    pub fn remote(&self) -> Arc<TrackRemote> {
        self.remote.clone()
    }
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.ended.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.ended.is_cancelled()
    }

    fn ended(&self) -> BoxFuture<'static, ()> {
        let token = self.ended.clone();
        Box::pin(async move { token.cancelled().await })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`MediaCapture`] that hands out fresh [`RtpTrack`]s. Whatever produces
/// the packets subscribes with [`RtpCapture::subscribe`] to learn about
/// new tracks
pub struct RtpCapture {
    display_available: bool,
    tracks: RwLock<Vec<Arc<RtpTrack>>>,
    new_tracks: broadcast::Sender<Arc<RtpTrack>>,
}

impl Default for RtpCapture {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RtpCapture {
    pub fn new(display_available: bool) -> Self {
        let (new_tracks, _) = broadcast::channel(64);
        Self {
            display_available,
            tracks: RwLock::new(vec![]),
            new_tracks,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RtpTrack>> {
        self.new_tracks.subscribe()
    }

    /// Tracks handed out so far that are still running
    pub fn live_tracks(&self) -> Vec<Arc<RtpTrack>> {
        self.tracks
            .read()
            .iter()
            .filter(|track| !track.is_stopped())
            .cloned()
            .collect()
    }

    fn publish(&self, tracks: Vec<Arc<RtpTrack>>) -> MediaStream {
        let mut stream = MediaStream::default();
        let mut registry = self.tracks.write();
        registry.retain(|track| !track.is_stopped());
        for track in tracks {
            registry.push(track.clone());
            let _ = self.new_tracks.send(track.clone());
            stream.add_track(track);
        }
        stream
    }
}

#[async_trait]
impl MediaCapture for RtpCapture {
    async fn user_media(&self, constraints: CaptureConstraints) -> Result<MediaStream, Error> {
        if !constraints.audio && !constraints.video {
            return Err(Error::CaptureDenied(
                "neither audio nor video was requested".into(),
            ));
        }
        let stream_id = Uuid::new_v4().to_string();
        let mut tracks = vec![];
        if constraints.audio {
            tracks.push(RtpTrack::audio(&stream_id));
        }
        if constraints.video {
            tracks.push(RtpTrack::video("camera", &stream_id));
        }
        Ok(self.publish(tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, Error> {
        if !self.display_available {
            return Err(Error::CaptureDenied("screen capture is unavailable".into()));
        }
        let stream_id = Uuid::new_v4().to_string();
        Ok(self.publish(vec![RtpTrack::video("screen", &stream_id)]))
    }
}
