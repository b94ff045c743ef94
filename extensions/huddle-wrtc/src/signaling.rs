//! PeerJS-style signaling: JSON frames over a websocket, relayed by the
//! brokering service between peers addressed by their participant id.
//!
//! The service answers the connection with `OPEN` (or `ID-TAKEN`), relays
//! `OFFER`, `ANSWER` and `CANDIDATE` frames between peers, and reports
//! unreachable or departed peers with `EXPIRE` and `LEAVE`.

use std::time::Duration;

use anyhow::{bail, Context};
use futures::{SinkExt, StreamExt};
use huddle::mesh::{CallMetadata, ParticipantId};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::config::SignalingServer;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection type carried by media calls. Data connections are not used
pub const MEDIA_CONNECTION: &str = "media";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum FrameKind {
    #[display(fmt = "OPEN")]
    Open,
    #[display(fmt = "OFFER")]
    Offer,
    #[display(fmt = "ANSWER")]
    Answer,
    #[display(fmt = "CANDIDATE")]
    Candidate,
    #[display(fmt = "LEAVE")]
    Leave,
    #[display(fmt = "EXPIRE")]
    Expire,
    #[display(fmt = "ERROR")]
    Error,
    #[display(fmt = "ID-TAKEN")]
    IdTaken,
    #[display(fmt = "HEARTBEAT")]
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<RTCSessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidatePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CallMetadata>,
    /// Set by the service on `ERROR` and `ID-TAKEN`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// Browser-shaped ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidatePayload> for RTCIceCandidateInit {
    fn from(payload: IceCandidatePayload) -> Self {
        RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        }
    }
}

impl Frame {
    pub fn heartbeat() -> Self {
        Self {
            kind: FrameKind::Heartbeat,
            src: None,
            dst: None,
            payload: None,
        }
    }

    pub fn offer(
        dst: &ParticipantId,
        connection_id: &str,
        sdp: RTCSessionDescription,
        metadata: CallMetadata,
    ) -> Self {
        Self::to_peer(
            FrameKind::Offer,
            dst,
            Payload {
                connection_type: Some(MEDIA_CONNECTION.into()),
                connection_id: Some(connection_id.into()),
                sdp: Some(sdp),
                metadata: Some(metadata),
                ..Default::default()
            },
        )
    }

    pub fn answer(dst: &ParticipantId, connection_id: &str, sdp: RTCSessionDescription) -> Self {
        Self::to_peer(
            FrameKind::Answer,
            dst,
            Payload {
                connection_type: Some(MEDIA_CONNECTION.into()),
                connection_id: Some(connection_id.into()),
                sdp: Some(sdp),
                ..Default::default()
            },
        )
    }

    pub fn candidate(
        dst: &ParticipantId,
        connection_id: &str,
        candidate: IceCandidatePayload,
    ) -> Self {
        Self::to_peer(
            FrameKind::Candidate,
            dst,
            Payload {
                connection_type: Some(MEDIA_CONNECTION.into()),
                connection_id: Some(connection_id.into()),
                candidate: Some(candidate),
                ..Default::default()
            },
        )
    }

    fn to_peer(kind: FrameKind, dst: &ParticipantId, payload: Payload) -> Self {
        Self {
            kind,
            src: None,
            dst: Some(dst.clone()),
            payload: Some(payload),
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.connection_id.as_deref())
    }

    pub fn message(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.msg.as_deref())
    }
}

/// Random lowercase alphanumeric string
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Id of a new media connection, unique per caller
pub fn media_connection_id() -> String {
    format!("mc_{}", random_token(12))
}

/// Outgoing half of the signaling connection. Cheap to clone
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl SignalingSender {
    pub fn send(&self, frame: Frame) -> anyhow::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| anyhow::anyhow!("signaling connection is closed"))
    }
}

/// Connection to the brokering service. Dropping it stops its tasks
pub struct SignalingClient {
    sender: SignalingSender,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl SignalingClient {
    /// Registers `id` with the service. Returns once the service confirmed
    /// the id, along with every frame received after that
    pub async fn connect(
        server: &SignalingServer,
        id: &ParticipantId,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<Frame>)> {
        let url = server.websocket_url(id, &random_token(10))?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("websocket connect to {} failed", server.host()))?;
        tracing::debug!(host = server.host(), %id, "signaling websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Frame>();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("failed to serialize {} frame: {e}", frame.kind);
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!("signaling websocket closed: {err}");
                            }
                            _ => tracing::warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };

                match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!("ignoring signaling message: {e}"),
                }
            }
        });

        let heartbeat_tx = send_tx.clone();
        let period = server.heartbeat_interval();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Frame::heartbeat()).is_err() {
                    break;
                }
            }
        });

        let client = Self {
            sender: SignalingSender { tx: send_tx },
            tasks: vec![writer, reader, heartbeat],
        };

        let first = tokio::time::timeout(OPEN_TIMEOUT, frame_rx.recv())
            .await
            .context("brokering service did not confirm the id")?;
        match first {
            Some(frame) if frame.kind == FrameKind::Open => {}
            Some(frame) if frame.kind == FrameKind::IdTaken => {
                bail!("id {id} is already registered with the brokering service")
            }
            Some(frame) => bail!(
                "brokering service refused the connection: {} {}",
                frame.kind,
                frame.message().unwrap_or_default()
            ),
            None => bail!("signaling websocket closed before it opened"),
        }

        Ok((client, frame_rx))
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }
}
