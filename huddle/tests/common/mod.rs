#![allow(dead_code)]

use std::{
    any::Any,
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use huddle::{
    config::Config,
    error::Error,
    mesh::{
        Args, CallEvent, CallEventStream, CallMetadata, CaptureConstraints, ConnectionBroker,
        IncomingCallStream, MediaCapture, MediaStream, MediaTrack, MembershipSource,
        MeshController, MeshEventKind, MeshEventStream, ParticipantId, ParticipantRecord,
        PeerCall, RenderSink, TrackKind, TrackSender,
    },
    sync::Mutex,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

pub const ROOM: &str = "ROOM01";

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: CancellationToken,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            ended: CancellationToken::new(),
        })
    }

    /// Ends the track the way the operating system would
    pub fn end(&self) {
        self.ended.cancel();
    }
}

impl MediaTrack for FakeTrack {
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

#[derive(Default)]
pub struct FakeCapture {
    pub deny_user_media: AtomicBool,
    pub deny_display: AtomicBool,
    pub user_media_calls: AtomicUsize,
    pub display_calls: AtomicUsize,
    pub tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeCapture {
    fn track(&self, prefix: &str, kind: TrackKind) -> Arc<dyn MediaTrack> {
        let mut tracks = self.tracks.lock();
        let track = FakeTrack::new(&format!("{prefix}-{}", tracks.len()), kind);
        tracks.push(track.clone());
        track
    }

    pub fn track_by_id(&self, id: &str) -> Option<Arc<FakeTrack>> {
        self.tracks.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.lock().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn user_media(&self, constraints: CaptureConstraints) -> Result<MediaStream, Error> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        if self.deny_user_media.load(Ordering::SeqCst) {
            return Err(Error::CaptureDenied("permission denied".into()));
        }
        let mut tracks = vec![];
        if constraints.audio {
            tracks.push(self.track("mic", TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(self.track("camera", TrackKind::Video));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, Error> {
        self.display_calls.fetch_add(1, Ordering::SeqCst);
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(Error::CaptureDenied("display capture cancelled".into()));
        }
        Ok(MediaStream::new(vec![self.track("screen", TrackKind::Video)]))
    }
}

pub struct FakeSender {
    kind: Option<TrackKind>,
    fail: AtomicBool,
    pub current: Mutex<Option<String>>,
}

impl FakeSender {
    pub fn current(&self) -> Option<String> {
        self.current.lock().clone()
    }
}

#[async_trait]
impl TrackSender for FakeSender {
    async fn kind(&self) -> Option<TrackKind> {
        self.kind
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::OtherWithContext("sender is gone".into()));
        }
        *self.current.lock() = Some(track.id().to_string());
        Ok(())
    }
}

pub struct FakeCall {
    peer_id: ParticipantId,
    metadata: Option<CallMetadata>,
    pub sent: Mutex<Option<MediaStream>>,
    pub answered: AtomicBool,
    pub closed: AtomicBool,
    senders: Mutex<Vec<Arc<FakeSender>>>,
    events_tx: UnboundedSender<CallEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<CallEvent>>>,
}

impl FakeCall {
    pub fn new(peer_id: &str, metadata: Option<CallMetadata>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peer_id: peer_id.into(),
            metadata,
            sent: Mutex::new(None),
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            senders: Mutex::new(vec![]),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// An inbound call whose caller named itself `caller_name`
    pub fn inbound(peer_id: &str, caller_name: Option<&str>) -> Arc<Self> {
        Self::new(
            peer_id,
            Some(CallMetadata {
                user_name: None,
                caller_name: caller_name.map(str::to_string),
            }),
        )
    }

    fn attach(&self, stream: &MediaStream) {
        let senders = stream
            .tracks()
            .iter()
            .map(|track| {
                Arc::new(FakeSender {
                    kind: Some(track.kind()),
                    fail: AtomicBool::new(false),
                    current: Mutex::new(Some(track.id().to_string())),
                })
            })
            .collect();
        *self.senders.lock() = senders;
        *self.sent.lock() = Some(stream.clone());
    }

    /// Drops every sender so the call has nothing to replace
    pub fn lose_senders(&self) {
        self.senders.lock().clear();
    }

    /// Makes the video sender reject replacements
    pub fn break_video_sender(&self) {
        if let Some(sender) = self.video_sender() {
            sender.fail.store(true, Ordering::SeqCst);
        }
    }

    pub fn video_sender(&self) -> Option<Arc<FakeSender>> {
        self.senders
            .lock()
            .iter()
            .find(|s| s.kind == Some(TrackKind::Video))
            .cloned()
    }

    pub fn emit(&self, event: CallEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Delivers a remote stream with a single video track
    pub fn deliver_stream(&self) {
        let track: Arc<dyn MediaTrack> =
            FakeTrack::new(&format!("remote-{}", self.peer_id), TrackKind::Video);
        self.emit(CallEvent::Stream(MediaStream::new(vec![track])));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerCall for FakeCall {
    fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    fn metadata(&self) -> Option<CallMetadata> {
        self.metadata.clone()
    }

    async fn answer(&self, stream: &MediaStream) -> Result<(), Error> {
        self.attach(stream);
        self.answered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.senders
            .lock()
            .iter()
            .map(|s| s.clone() as Arc<dyn TrackSender>)
            .collect()
    }

    fn events(&self) -> CallEventStream {
        match self.events_rx.lock().take() {
            Some(mut rx) => CallEventStream(Box::pin(async_stream::stream! {
                while let Some(event) = rx.recv().await {
                    yield event;
                }
            })),
            None => CallEventStream(Box::pin(futures::stream::empty())),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(CallEvent::Closed);
        }
        Ok(())
    }
}

pub struct FakeBroker {
    pub calls: Mutex<Vec<(ParticipantId, CallMetadata)>>,
    pub opened: Mutex<Vec<Arc<FakeCall>>>,
    pub unreachable: Mutex<HashSet<ParticipantId>>,
    incoming_tx: UnboundedSender<Arc<dyn PeerCall>>,
    incoming_rx: Mutex<Option<UnboundedReceiver<Arc<dyn PeerCall>>>>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            calls: Mutex::default(),
            opened: Mutex::default(),
            unreachable: Mutex::default(),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }
}

impl FakeBroker {
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_to(&self, peer_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() == peer_id)
            .count()
    }

    /// Latest connection opened to `peer_id`
    pub fn opened_to(&self, peer_id: &str) -> Option<Arc<FakeCall>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|c| c.peer_id.as_str() == peer_id)
            .cloned()
    }

    /// Simulates `call` arriving from the brokering service
    pub fn offer(&self, call: Arc<FakeCall>) {
        let _ = self.incoming_tx.send(call as Arc<dyn PeerCall>);
    }

    pub fn set_unreachable(&self, peer_id: &str) {
        self.unreachable.lock().insert(peer_id.into());
    }
}

#[async_trait]
impl ConnectionBroker for FakeBroker {
    async fn call(
        &self,
        peer_id: &ParticipantId,
        stream: &MediaStream,
        metadata: CallMetadata,
    ) -> Result<Arc<dyn PeerCall>, Error> {
        self.calls.lock().push((peer_id.clone(), metadata.clone()));
        if self.unreachable.lock().contains(peer_id) {
            return Err(Error::Signaling(format!("{peer_id} is unreachable")));
        }
        let call = FakeCall::new(peer_id.as_str(), None);
        call.attach(stream);
        self.opened.lock().push(call.clone());
        Ok(call as Arc<dyn PeerCall>)
    }

    fn incoming(&self) -> IncomingCallStream {
        match self.incoming_rx.lock().take() {
            Some(mut rx) => IncomingCallStream(Box::pin(async_stream::stream! {
                while let Some(call) = rx.recv().await {
                    yield call;
                }
            })),
            None => IncomingCallStream(Box::pin(futures::stream::empty())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub is_local: bool,
}

#[derive(Default)]
pub struct FakeRender {
    pub rendered: Mutex<Vec<Rendered>>,
    pub removed: Mutex<Vec<ParticipantId>>,
    pub lists: Mutex<Vec<Vec<ParticipantRecord>>>,
}

impl FakeRender {
    pub fn label_for(&self, participant_id: &str) -> Option<String> {
        self.rendered
            .lock()
            .iter()
            .rev()
            .find(|r| r.participant_id.as_str() == participant_id)
            .map(|r| r.display_name.clone())
    }

    pub fn was_removed(&self, participant_id: &str) -> bool {
        self.removed
            .lock()
            .iter()
            .any(|id| id.as_str() == participant_id)
    }
}

impl RenderSink for FakeRender {
    fn render(
        &self,
        participant_id: &ParticipantId,
        _stream: &MediaStream,
        display_name: &str,
        is_local: bool,
    ) {
        self.rendered.lock().push(Rendered {
            participant_id: participant_id.clone(),
            display_name: display_name.into(),
            is_local,
        });
    }

    fn remove(&self, participant_id: &ParticipantId) {
        self.removed.lock().push(participant_id.clone());
    }

    fn participants(&self, participants: &[ParticipantRecord]) {
        self.lists.lock().push(participants.to_vec());
    }
}

#[derive(Default)]
pub struct FakeMembership {
    pub members: Mutex<Vec<ParticipantRecord>>,
    pub offline: AtomicBool,
    pub fetches: AtomicUsize,
    pub leaves: AtomicUsize,
}

impl FakeMembership {
    pub fn set(&self, members: Vec<ParticipantRecord>) {
        *self.members.lock() = members;
    }
}

#[async_trait]
impl MembershipSource for FakeMembership {
    async fn participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>, Error> {
        assert_eq!(room_id, ROOM);
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::MembershipFetchFailed("connection refused".into()));
        }
        Ok(self.members.lock().clone())
    }

    async fn leave(&self, _room_id: &str) -> Result<(), Error> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn members(ids: &[&str]) -> Vec<ParticipantRecord> {
    ids.iter()
        .map(|id| ParticipantRecord::new(*id, format!("user {id}")))
        .collect()
}

pub struct Harness {
    pub controller: MeshController,
    pub events: MeshEventStream,
    pub broker: Arc<FakeBroker>,
    pub membership: Arc<FakeMembership>,
    pub capture: Arc<FakeCapture>,
    pub render: Arc<FakeRender>,
}

impl Harness {
    pub fn new(local_id: &str) -> Self {
        Self::with_config(Config::testing(ROOM, local_id, &format!("user {local_id}")))
    }

    pub fn with_config(config: Config) -> Self {
        let broker = Arc::new(FakeBroker::default());
        let membership = Arc::new(FakeMembership::default());
        let capture = Arc::new(FakeCapture::default());
        let render = Arc::new(FakeRender::default());

        let controller = MeshController::new(Args {
            config,
            broker: broker.clone(),
            membership: membership.clone(),
            capture: capture.clone(),
            render: render.clone(),
        });
        let events = controller.get_event_stream();

        Self {
            controller,
            events,
            broker,
            membership,
            capture,
            render,
        }
    }

    /// Collects every event emitted so far
    pub fn drain_events(&mut self) -> Vec<MeshEventKind> {
        let mut events = vec![];
        while let Some(Some(event)) = self.events.next().now_or_never() {
            events.push(event);
        }
        events
    }
}

/// Lets spawned tasks run. Under a paused clock this also auto-advances time
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
