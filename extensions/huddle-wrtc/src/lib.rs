//! WebRTC binding for the `huddle` mesh.
//!
//! [`WrtcBroker`] implements [`huddle::mesh::ConnectionBroker`] with one
//! `webrtc` peer connection per call. Offers, answers and ICE candidates are
//! exchanged through a PeerJS-style brokering service (see [`signaling`]).
//! Local media is made of [`RtpTrack`]s; the application writes RTP packets
//! into them and every connection the track is attached to receives them.
//!
//! Transforming audio/video into RTP packets is the user's responsibility.
//! `webrtc-rs` provides an `rtp::packetizer` for that.

pub mod broker;
pub mod call;
pub mod config;
pub mod media;
pub mod signaling;

pub use broker::WrtcBroker;
pub use call::{WrtcCall, WrtcSender};
pub use config::{SignalingServer, WrtcConfig};
pub use media::{RemoteTrack, RtpCapture, RtpTrack};
