//! The full-mesh call: one direct connection per remote participant.
//!
//! - [`MembershipSource`] reports who is in the room
//! - [`ConnectionBroker`] opens and receives connections to individual peers
//! - [`MediaCapture`] and [`RenderSink`] stand in for devices and the UI
//! - [`MeshController`] owns the [`ConnectionTable`] and the local media and
//!   ties everything together
//!
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

mod controller;
mod media;
mod membership;
mod poller;
mod switcher;
mod table;

pub use controller::{Args, MeshController};
pub use media::{
    CaptureConstraints, LocalMediaState, MediaCapture, MediaStream, MediaTrack, TrackKind,
    TrackSource,
};
pub use membership::HttpMembership;
pub use table::{ConnectionEntry, ConnectionId, ConnectionTable, EntryState};

/// Label used for a remote stream when the caller did not name itself
pub const DEFAULT_PARTICIPANT_LABEL: &str = "Participant";

/// Opaque identifier the room service and the brokering service agree on
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for ParticipantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn enabled_by_default() -> bool {
    true
}

/// A room member as reported by the room service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    #[serde(rename = "user_id")]
    pub id: ParticipantId,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "enabled_by_default")]
    pub audio_enabled: bool,
    #[serde(default = "enabled_by_default")]
    pub video_enabled: bool,
}

impl ParticipantRecord {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_admin: false,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}

impl PartialEq for ParticipantRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ParticipantRecord {}

/// Sent along with an outbound call so the callee can label the stream
/// without looking the caller up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    /// Name the room service lists for the callee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Display name of the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
}

impl CallMetadata {
    /// Label to render the caller's stream under
    pub fn label(&self) -> &str {
        self.caller_name
            .as_deref()
            .or(self.user_name.as_deref())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_PARTICIPANT_LABEL)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "media acquired")]
    MediaAcquired,
    #[display(fmt = "joined")]
    Joined,
    #[display(fmt = "leaving")]
    Leaving,
    #[display(fmt = "left")]
    Left,
}

/// Reports the current members of a room
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>, Error>;

    /// Tells the room service the local participant has left
    async fn leave(&self, _room_id: &str) -> Result<(), Error> {
        Ok(())
    }
}

/// Opens connections to peers and hands over the ones peers open to us
#[async_trait]
pub trait ConnectionBroker: Send + Sync {
    /// Opens an outbound connection carrying `stream`. Returns once the
    /// brokering service accepted the request; the remote stream arrives
    /// later as a [`CallEvent::Stream`]
    async fn call(
        &self,
        peer_id: &ParticipantId,
        stream: &MediaStream,
        metadata: CallMetadata,
    ) -> Result<Arc<dyn PeerCall>, Error>;

    /// Connections opened by remote peers, not yet answered.
    /// Only the first caller receives the calls
    fn incoming(&self) -> IncomingCallStream;
}

/// A single peer connection
#[async_trait]
pub trait PeerCall: Send + Sync {
    fn peer_id(&self) -> &ParticipantId;

    /// Metadata supplied by the caller. `None` for outbound calls
    fn metadata(&self) -> Option<CallMetadata>;

    /// Accepts an inbound call, sending `stream` back
    async fn answer(&self, stream: &MediaStream) -> Result<(), Error>;

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>>;

    /// Lifecycle events of the connection. Events emitted before this is
    /// called are buffered; only the first caller receives them
    fn events(&self) -> CallEventStream;

    async fn close(&self) -> Result<(), Error>;
}

/// Outgoing half of one media track within a connection
#[async_trait]
pub trait TrackSender: Send + Sync {
    /// Kind of the track currently attached, if any
    async fn kind(&self) -> Option<TrackKind>;

    /// Swaps the outgoing track in place, without renegotiating the connection
    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), Error>;
}

/// Displays local and remote streams
pub trait RenderSink: Send + Sync {
    /// Creates or replaces the view for `participant_id`
    fn render(
        &self,
        participant_id: &ParticipantId,
        stream: &MediaStream,
        display_name: &str,
        is_local: bool,
    );

    fn remove(&self, participant_id: &ParticipantId);

    /// Refreshed participant list after each membership poll
    fn participants(&self, _participants: &[ParticipantRecord]) {}
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The remote media arrived
    Stream(MediaStream),
    Error(String),
    Closed,
}

pub struct CallEventStream(pub BoxStream<'static, CallEvent>);

impl core::ops::Deref for CallEventStream {
    type Target = BoxStream<'static, CallEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for CallEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub struct IncomingCallStream(pub BoxStream<'static, Arc<dyn PeerCall>>);

impl core::ops::Deref for IncomingCallStream {
    type Target = BoxStream<'static, Arc<dyn PeerCall>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for IncomingCallStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Drives the UI
#[derive(Debug, Clone, Display)]
pub enum MeshEventKind {
    #[display(fmt = "Joined room {}", room_id)]
    Joined { room_id: String },
    /// An outbound connection was handed to the brokering service
    #[display(fmt = "Connecting to {}", peer_id)]
    ParticipantConnecting { peer_id: ParticipantId },
    #[display(fmt = "Receiving media from {} ({})", peer_id, display_name)]
    ParticipantStream {
        peer_id: ParticipantId,
        display_name: String,
    },
    #[display(fmt = "{} left", peer_id)]
    ParticipantLeft { peer_id: ParticipantId },
    #[display(fmt = "Connection to {} failed: {}", peer_id, reason)]
    ConnectionFailed {
        peer_id: ParticipantId,
        reason: String,
    },
    /// The peer called while a connection to it already existed
    #[display(fmt = "Connection to {} was replaced", peer_id)]
    ConnectionReplaced { peer_id: ParticipantId },
    #[display(fmt = "Unable to replace outgoing video for {}: {}", peer_id, reason)]
    TrackReplaceFailed {
        peer_id: ParticipantId,
        reason: String,
    },
    #[display(fmt = "Membership updated")]
    MembershipUpdated {
        participants: Vec<ParticipantRecord>,
    },
    #[display(fmt = "Membership unavailable: {}", reason)]
    MembershipFetchFailed { reason: String },
    #[display(fmt = "Sending {}", source)]
    SourceChanged { source: TrackSource },
    #[display(fmt = "Audio enabled: {}, video enabled: {}", audio_enabled, video_enabled)]
    LocalMediaChanged {
        audio_enabled: bool,
        video_enabled: bool,
    },
    /// An admin asked `peer_id` to mute
    #[display(fmt = "Mute requested for {}", peer_id)]
    MuteRequested { peer_id: ParticipantId },
    #[display(fmt = "Left room {}", room_id)]
    Left { room_id: String },
}

pub struct MeshEventStream(pub BoxStream<'static, MeshEventKind>);

impl core::ops::Deref for MeshEventStream {
    type Target = BoxStream<'static, MeshEventKind>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for MeshEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
