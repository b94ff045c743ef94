/// Errors raised by the mesh controller and its capability adapters.
use thiserror::Error;

use crate::mesh::{LifecycleState, ParticipantId};

#[derive(Error, Debug)]
pub enum Error {
    //Media Errors
    #[error("Local media capture failed: {0}")]
    CaptureDenied(String),
    #[error("Media stream has no video track")]
    NoVideoTrack,

    //Connection Errors
    #[error("Connection to {peer} failed: {reason}")]
    ConnectionFailed { peer: ParticipantId, reason: String },
    #[error("Unable to replace outgoing video for {peer}: {reason}")]
    TrackReplaceFailed { peer: ParticipantId, reason: String },
    #[error("Signaling failed: {0}")]
    Signaling(String),

    //Membership Errors
    #[error("Unable to fetch room membership: {0}")]
    MembershipFetchFailed(String),
    #[error("Membership endpoint is invalid: {0}")]
    InvalidUrl(#[from] url::ParseError),

    //Controller Errors
    #[error("Operation is not valid while the controller is {state}")]
    InvalidState { state: LifecycleState },
    #[error("Local participant is not an admin")]
    NotAdmin,
    #[error("Controller is unavailable")]
    ControllerUnavailable,

    //Misc
    #[error("{0}")]
    OtherWithContext(String),
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error("An unknown error has occurred")]
    Other,
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        Error::ControllerUnavailable
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ControllerUnavailable
    }
}
