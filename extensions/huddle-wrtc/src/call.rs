use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use huddle::{
    error::Error,
    mesh::{
        CallEvent, CallEventStream, CallMetadata, MediaStream, MediaTrack, ParticipantId,
        PeerCall, TrackKind, TrackSender,
    },
};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::rtp_sender::RTCRtpSender,
    track::track_local::TrackLocal,
};

use crate::{
    media::{RemoteTrack, RtpTrack},
    signaling::{Frame, SignalingSender},
};

/// Delivers [`CallEvent`]s to whoever took the stream. `Closed` is sent at
/// most once
pub(crate) struct CallEvents {
    tx: mpsc::UnboundedSender<CallEvent>,
    closed: AtomicBool,
}

impl CallEvents {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        if self.is_closed() {
            return;
        }
        if matches!(event, CallEvent::Closed) {
            self.closed.store(true, Ordering::SeqCst);
        }
        let _ = self.tx.send(event);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connection state callback. Failure ends the call
    pub(crate) fn on_state(&self, peer: &ParticipantId, state: RTCPeerConnectionState) {
        tracing::info!("WebRTC connection state for peer {peer} has changed {state}");
        match state {
            RTCPeerConnectionState::Failed => {
                self.emit(CallEvent::Error("peer connection failed".into()));
                self.emit(CallEvent::Closed);
            }
            RTCPeerConnectionState::Closed => self.emit(CallEvent::Closed),
            _ => {}
        }
    }
}

/// Streams sent by a peer arrive one track at a time. Each arrival
/// re-announces the grown stream
pub(crate) struct RemoteMedia {
    stream: Mutex<MediaStream>,
}

impl RemoteMedia {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(MediaStream::default()),
        })
    }

    pub(crate) fn add(&self, track: Arc<RemoteTrack>) -> MediaStream {
        let mut stream = self.stream.lock();
        stream.add_track(track);
        stream.clone()
    }

    fn stop(&self) {
        self.stream.lock().stop();
    }
}

/// One [`RTCRtpSender`] of a call
pub struct WrtcSender {
    sender: Arc<RTCRtpSender>,
    kind: Mutex<Option<TrackKind>>,
    rtcp_reader: JoinHandle<()>,
}

impl Drop for WrtcSender {
    fn drop(&mut self) {
        self.rtcp_reader.abort();
    }
}

impl WrtcSender {
    fn new(sender: Arc<RTCRtpSender>, kind: TrackKind) -> Self {
        // Read incoming RTCP packets so interceptors (NACK, reports) keep running
        let reader = sender.clone();
        let rtcp_reader = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = reader.read(&mut rtcp_buf).await {}
            tracing::debug!("terminating rtp_sender reader");
        });
        Self {
            sender,
            kind: Mutex::new(Some(kind)),
            rtcp_reader,
        }
    }
}

#[async_trait]
impl TrackSender for WrtcSender {
    async fn kind(&self) -> Option<TrackKind> {
        *self.kind.lock()
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), Error> {
        let rtp = RtpTrack::from_track(&track).ok_or_else(|| {
            Error::OtherWithContext(format!("track {} is not an RTP track", track.id()))
        })?;
        let local: Arc<dyn TrackLocal + Send + Sync> = rtp.local();
        self.sender
            .replace_track(Some(local))
            .await
            .map_err(anyhow::Error::from)?;
        *self.kind.lock() = Some(rtp.kind());
        Ok(())
    }
}

/// A media call with one peer, in either direction
pub struct WrtcCall {
    peer_id: ParticipantId,
    connection_id: String,
    metadata: Option<CallMetadata>,
    connection: Arc<RTCPeerConnection>,
    signaling: SignalingSender,
    senders: Mutex<Vec<Arc<WrtcSender>>>,
    events: Arc<CallEvents>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,
    remote: Arc<RemoteMedia>,
}

impl WrtcCall {
    pub(crate) fn new(
        peer_id: ParticipantId,
        connection_id: String,
        metadata: Option<CallMetadata>,
        connection: Arc<RTCPeerConnection>,
        signaling: SignalingSender,
    ) -> (Self, Arc<CallEvents>, Arc<RemoteMedia>) {
        let (events, event_rx) = CallEvents::new();
        let remote = RemoteMedia::new();
        let call = Self {
            peer_id,
            connection_id,
            metadata,
            connection,
            signaling,
            senders: Mutex::new(vec![]),
            events: events.clone(),
            event_rx: Mutex::new(Some(event_rx)),
            remote: remote.clone(),
        };
        (call, events, remote)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn connection(&self) -> Arc<RTCPeerConnection> {
        self.connection.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Adds every RTP track of `stream` to the connection. Tracks of other
    /// implementations are skipped
    pub(crate) async fn attach(&self, stream: &MediaStream) -> anyhow::Result<()> {
        for track in stream.tracks() {
            let Some(rtp) = RtpTrack::from_track(track) else {
                tracing::warn!("track {} is not an RTP track and is not sent", track.id());
                continue;
            };
            let sender = self.connection.add_track(rtp.local()).await?;
            self.senders
                .lock()
                .push(Arc::new(WrtcSender::new(sender, rtp.kind())));
        }
        Ok(())
    }

    pub(crate) async fn offer(
        &self,
        stream: &MediaStream,
        metadata: CallMetadata,
    ) -> anyhow::Result<()> {
        self.attach(stream).await?;
        let local_sdp = self.connection.create_offer(None).await?;
        // starts gathering ICE candidates
        self.connection
            .set_local_description(local_sdp.clone())
            .await?;
        self.signaling.send(Frame::offer(
            &self.peer_id,
            &self.connection_id,
            local_sdp,
            metadata,
        ))
    }

    pub(crate) async fn recv_sdp(&self, sdp: RTCSessionDescription) -> anyhow::Result<()> {
        self.connection.set_remote_description(sdp).await?;
        Ok(())
    }

    pub(crate) async fn recv_ice(&self, candidate: RTCIceCandidateInit) -> anyhow::Result<()> {
        self.connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// The peer went away without closing the call
    pub(crate) async fn remote_left(&self) {
        if let Err(e) = self.close().await {
            tracing::error!("failed to close call with {}: {e}", self.peer_id);
        }
    }
}

#[async_trait]
impl PeerCall for WrtcCall {
    fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    fn metadata(&self) -> Option<CallMetadata> {
        self.metadata.clone()
    }

    async fn answer(&self, stream: &MediaStream) -> Result<(), Error> {
        let map_err = |e: anyhow::Error| Error::ConnectionFailed {
            peer: self.peer_id.clone(),
            reason: e.to_string(),
        };
        self.attach(stream).await.map_err(map_err)?;

        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| map_err(e.into()))?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| map_err(e.into()))?;

        self.signaling
            .send(Frame::answer(&self.peer_id, &self.connection_id, answer))
            .map_err(|e| Error::Signaling(e.to_string()))
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.senders
            .lock()
            .iter()
            .map(|sender| sender.clone() as Arc<dyn TrackSender>)
            .collect()
    }

    fn events(&self) -> CallEventStream {
        match self.event_rx.lock().take() {
            Some(rx) => CallEventStream(Box::pin(UnboundedReceiverStream::new(rx))),
            None => CallEventStream(Box::pin(futures::stream::empty())),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.senders.lock().clear();
        self.remote.stop();
        let result = self.connection.close().await;
        self.events.emit(CallEvent::Closed);
        result.map_err(|e| Error::Any(e.into()))
    }
}
