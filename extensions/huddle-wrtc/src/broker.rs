use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Context};
use async_trait::async_trait;
use huddle::{
    error::Error,
    mesh::{
        CallEvent, CallMetadata, ConnectionBroker, IncomingCallStream, MediaStream,
        ParticipantId, PeerCall,
    },
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::RTCIceCandidate, ice_connection_state::RTCIceConnectionState,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecParameters, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
    },
    track::track_remote::TrackRemote,
};

use crate::{
    call::WrtcCall,
    config::WrtcConfig,
    media::{opus_capability, vp8_capability, RemoteTrack},
    signaling::{media_connection_id, Frame, FrameKind, SignalingClient, SignalingSender},
};

/// [`ConnectionBroker`] over WebRTC peer connections, brokered by a
/// PeerJS-style signaling service.
///
/// Every call is keyed by its connection id, so several calls with the same
/// peer (a superseded one and its replacement) can coexist until the mesh
/// closes the old one.
#[derive(Clone)]
pub struct WrtcBroker {
    inner: Arc<Inner>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn PeerCall>>>>>,
    _task_cancellation: Arc<DropGuard>,
}

struct Inner {
    local_id: ParticipantId,
    api: API,
    config: WrtcConfig,
    signaling: SignalingSender,
    calls: RwLock<HashMap<String, Arc<WrtcCall>>>,
    _client: SignalingClient,
}

impl WrtcBroker {
    /// Registers `local_id` with the signaling service
    pub async fn connect(local_id: ParticipantId, config: WrtcConfig) -> anyhow::Result<Self> {
        let (client, mut frames) = SignalingClient::connect(config.signaling(), &local_id)
            .await
            .context("failed to register with the brokering service")?;
        tracing::info!(%local_id, "registered with the brokering service");

        let inner = Arc::new(Inner {
            local_id,
            api: create_api()?,
            config,
            signaling: client.sender(),
            calls: RwLock::new(HashMap::new()),
            _client: client,
        });

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let drop_guard = token.clone().drop_guard();

        let dispatch = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = frames.recv() => {
                        let Some(frame) = frame else {
                            tracing::warn!("signaling connection closed");
                            break;
                        };
                        if let Err(e) = dispatch.handle_frame(frame, &incoming_tx).await {
                            tracing::error!("failed to handle signaling frame: {e}");
                        }
                    }
                }
            }
            dispatch.close_all().await;
        });

        Ok(Self {
            inner,
            incoming: Arc::new(Mutex::new(Some(incoming_rx))),
            _task_cancellation: Arc::new(drop_guard),
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.inner.local_id
    }
}

#[async_trait]
impl ConnectionBroker for WrtcBroker {
    async fn call(
        &self,
        peer_id: &ParticipantId,
        stream: &MediaStream,
        metadata: CallMetadata,
    ) -> Result<Arc<dyn PeerCall>, Error> {
        let call = self
            .inner
            .connect(peer_id, media_connection_id(), None)
            .await
            .map_err(|e| Error::ConnectionFailed {
                peer: peer_id.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = call.offer(stream, metadata).await {
            self.inner.remove(call.connection_id());
            if let Err(e) = call.close().await {
                tracing::warn!("failed to close call to {peer_id}: {e}");
            }
            return Err(Error::ConnectionFailed {
                peer: peer_id.clone(),
                reason: e.to_string(),
            });
        }
        Ok(call as Arc<dyn PeerCall>)
    }

    fn incoming(&self) -> IncomingCallStream {
        match self.incoming.lock().take() {
            Some(rx) => IncomingCallStream(Box::pin(UnboundedReceiverStream::new(rx))),
            None => IncomingCallStream(Box::pin(futures::stream::empty())),
        }
    }
}

impl Inner {
    fn get(&self, connection_id: Option<&str>) -> Option<Arc<WrtcCall>> {
        connection_id.and_then(|id| self.calls.read().get(id).cloned())
    }

    fn remove(&self, connection_id: &str) -> Option<Arc<WrtcCall>> {
        self.calls.write().remove(connection_id)
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        incoming: &mpsc::UnboundedSender<Arc<dyn PeerCall>>,
    ) -> anyhow::Result<()> {
        self.calls.write().retain(|_, call| !call.is_closed());

        match frame.kind {
            FrameKind::Offer => {
                let Some(src) = frame.src.clone() else {
                    bail!("offer without a sender");
                };
                let Some(payload) = frame.payload else {
                    bail!("offer from {src} without a payload");
                };
                let (Some(connection_id), Some(sdp)) = (payload.connection_id, payload.sdp) else {
                    bail!("offer from {src} is missing its connection id or sdp");
                };
                if self.calls.read().contains_key(&connection_id) {
                    tracing::warn!("ignoring repeated offer {connection_id} from {src}");
                    return Ok(());
                }

                let call = self
                    .connect(&src, connection_id, Some(payload.metadata.unwrap_or_default()))
                    .await?;
                if let Err(e) = call.recv_sdp(sdp).await {
                    self.remove(call.connection_id());
                    call.remote_left().await;
                    return Err(e);
                }
                tracing::info!(peer = %src, "incoming call");
                if incoming.send(call.clone() as Arc<dyn PeerCall>).is_err() {
                    call.remote_left().await;
                }
            }
            FrameKind::Answer => {
                let call = self
                    .get(frame.connection_id())
                    .context("answer for an unknown connection")?;
                let sdp = frame
                    .payload
                    .and_then(|payload| payload.sdp)
                    .context("answer without sdp")?;
                call.recv_sdp(sdp).await?;
            }
            FrameKind::Candidate => {
                let call = self
                    .get(frame.connection_id())
                    .context("candidate for an unknown connection")?;
                let candidate = frame
                    .payload
                    .and_then(|payload| payload.candidate)
                    .context("candidate frame without a candidate")?;
                call.recv_ice(candidate.into()).await?;
            }
            FrameKind::Leave | FrameKind::Expire => {
                let Some(src) = frame.src else {
                    return Ok(());
                };
                tracing::info!(peer = %src, "{} from brokering service", frame.kind);
                let calls = self
                    .calls
                    .read()
                    .values()
                    .filter(|call| call.peer_id() == &src)
                    .cloned()
                    .collect::<Vec<_>>();
                for call in calls {
                    self.remove(call.connection_id());
                    call.remote_left().await;
                }
            }
            FrameKind::Error => {
                tracing::warn!(
                    "brokering service error: {}",
                    frame.message().unwrap_or_default()
                );
            }
            FrameKind::IdTaken => {
                bail!("id {} was taken over by another session", self.local_id)
            }
            FrameKind::Open | FrameKind::Heartbeat => {}
        }
        Ok(())
    }

    async fn close_all(&self) {
        let calls = self
            .calls
            .write()
            .drain()
            .map(|(_, call)| call)
            .collect::<Vec<_>>();
        for call in calls {
            call.remote_left().await;
        }
    }

    /// Creates a peer connection with its callbacks and registers the call
    async fn connect(
        &self,
        peer_id: &ParticipantId,
        connection_id: String,
        metadata: Option<CallMetadata>,
    ) -> anyhow::Result<Arc<WrtcCall>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers().to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let connection = Arc::new(self.api.new_peer_connection(config).await?);

        let (call, events, remote) = WrtcCall::new(
            peer_id.clone(),
            connection_id.clone(),
            metadata,
            connection.clone(),
            self.signaling.clone(),
        );

        let dest = peer_id.clone();
        let state_events = events.clone();
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                state_events.on_state(&dest, state);
                Box::pin(futures::future::ready(()))
            },
        ));

        let signaling = self.signaling.clone();
        let dest = peer_id.clone();
        let id = connection_id.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                match candidate.to_json() {
                    Ok(init) => {
                        let frame = Frame::candidate(&dest, &id, init.into());
                        if let Err(e) = signaling.send(frame) {
                            tracing::error!("failed to send ice candidate to peer {dest}: {e}");
                        }
                    }
                    Err(e) => tracing::error!("failed to serialize ice candidate: {e}"),
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let dest = peer_id.clone();
        connection.on_ice_connection_state_change(Box::new(
            move |connection_state: RTCIceConnectionState| {
                tracing::debug!(
                    "ICE connection state for peer {dest} has changed {connection_state}"
                );
                Box::pin(futures::future::ready(()))
            },
        ));

        let dest = peer_id.clone();
        connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                match track.and_then(RemoteTrack::new) {
                    Some(track) => {
                        let stream = remote.add(track);
                        events.emit(CallEvent::Stream(stream));
                    }
                    None => tracing::debug!("ignoring unusable track from {dest}"),
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        let call = Arc::new(call);
        self.calls.write().insert(connection_id, call.clone());
        Ok(call)
    }
}

/// Registers Opus and VP8, the codecs [`RtpTrack`](crate::media::RtpTrack)s
/// are created with
fn create_api() -> anyhow::Result<API> {
    let mut media = MediaEngine::default();

    media.register_codec(
        RTCRtpCodecParameters {
            capability: opus_capability(),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: vp8_capability(),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    // NACKs, RTCP reports and the other default interceptors
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

#[cfg(test)]
mod test {
    use super::create_api;

    #[tokio::test]
    async fn api_creates_peer_connections() -> anyhow::Result<()> {
        let api = create_api()?;
        let connection = api.new_peer_connection(Default::default()).await?;
        connection.close().await?;
        Ok(())
    }
}
