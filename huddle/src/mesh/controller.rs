use std::sync::Arc;

use futures::{channel::oneshot, StreamExt};
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Notify,
    },
    task::JoinHandle,
};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{
    poller::{self, PollEvent},
    switcher, CallEvent, CallEventStream, CallMetadata, CaptureConstraints, ConnectionBroker,
    ConnectionEntry, ConnectionId, ConnectionTable, EntryState, LifecycleState, LocalMediaState,
    MediaCapture, MediaTrack, MembershipSource, MeshEventKind, MeshEventStream, ParticipantId,
    ParticipantRecord, PeerCall, RenderSink, TrackKind, TrackSource, DEFAULT_PARTICIPANT_LABEL,
};
use crate::{config::Config, error::Error};

enum Cmd {
    Join {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    Leave {
        rsp: oneshot::Sender<()>,
    },
    Reconcile {
        members: Vec<ParticipantRecord>,
        rsp: oneshot::Sender<Result<Vec<ParticipantId>, Error>>,
    },
    Initiate {
        peer_id: ParticipantId,
        display_name: String,
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    SwitchOutgoingVideo {
        track: Arc<dyn MediaTrack>,
        source: TrackSource,
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    ShareScreen {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    StopScreenShare {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    ToggleVideo {
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    ToggleAudio {
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    MuteAll {
        rsp: oneshot::Sender<Result<Vec<ParticipantId>, Error>>,
    },
    RemoveAll {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    GetState {
        rsp: oneshot::Sender<LifecycleState>,
    },
    GetLocalMedia {
        rsp: oneshot::Sender<Option<LocalMediaState>>,
    },
    GetConnectedPeers {
        rsp: oneshot::Sender<Vec<ParticipantId>>,
    },
}

/// An event from one connection, tagged with the table serial it was
/// registered under
struct CallEnvelope {
    peer_id: ParticipantId,
    serial: ConnectionId,
    event: CallEvent,
}

pub struct Args {
    pub config: Config,
    pub broker: Arc<dyn ConnectionBroker>,
    pub membership: Arc<dyn MembershipSource>,
    pub capture: Arc<dyn MediaCapture>,
    pub render: Arc<dyn RenderSink>,
}

/// Handle to the task that owns the local media and every peer connection.
///
/// All operations are processed one at a time by that task, so a membership
/// pass, an inbound call and a screen share can never interleave their
/// changes to the connection table. Dropping the last handle leaves the room.
#[derive(Clone)]
pub struct MeshController {
    ch: UnboundedSender<Cmd>,
    event_ch: broadcast::Sender<MeshEventKind>,
    refresh: Arc<Notify>,
    _task_cancellation: Arc<DropGuard>,
}

impl MeshController {
    pub fn new(args: Args) -> Self {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_ch, _) = broadcast::channel(1024);
        let refresh = Arc::new(Notify::new());

        let (task, receivers) = ControllerTask::new(args, event_ch.clone(), refresh.clone());

        let token = CancellationToken::new();
        let drop_guard = token.clone().drop_guard();
        tokio::spawn(async move {
            task.run(cmd_rx, receivers, token).await;
        });

        Self {
            ch: tx,
            event_ch,
            refresh,
            _task_cancellation: Arc::new(drop_guard),
        }
    }

    /// The event stream notifies the UI of mesh related events
    pub fn get_event_stream(&self) -> MeshEventStream {
        let mut rx = self.event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        MeshEventStream(Box::pin(stream))
    }

    /// Acquires local media, renders it, and starts following the room's
    /// membership. Fails with [`Error::CaptureDenied`] if media could not be
    /// captured, in which case nothing else happens.
    pub async fn join(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::Join { rsp: tx })?;
        rx.await?
    }

    /// Closes every connection, releases local media and notifies the room
    /// service. Calling it again has no effect.
    pub async fn leave(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::Leave { rsp: tx })?;
        rx.await?;
        Ok(())
    }

    /// Runs one reconciliation pass against `members`, returning the peers
    /// a connection was opened to
    pub async fn reconcile(
        &self,
        members: Vec<ParticipantRecord>,
    ) -> Result<Vec<ParticipantId>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::Reconcile { members, rsp: tx })?;
        rx.await?
    }

    /// Opens a connection to `peer_id` unless it is the local participant or
    /// a connection already exists. Returns whether a connection was opened
    pub async fn initiate(
        &self,
        peer_id: impl Into<ParticipantId>,
        display_name: &str,
    ) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::Initiate {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            rsp: tx,
        })?;
        rx.await?
    }

    /// Sends `track` as the outgoing video on every connection
    pub async fn switch_outgoing_video(
        &self,
        track: Arc<dyn MediaTrack>,
        source: TrackSource,
    ) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::SwitchOutgoingVideo {
            track,
            source,
            rsp: tx,
        })?;
        rx.await?
    }

    pub async fn share_screen(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::ShareScreen { rsp: tx })?;
        rx.await?
    }

    pub async fn stop_screen_share(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::StopScreenShare { rsp: tx })?;
        rx.await?
    }

    /// Returns whether video is enabled afterwards
    pub async fn toggle_video(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::ToggleVideo { rsp: tx })?;
        rx.await?
    }

    /// Returns whether audio is enabled afterwards
    pub async fn toggle_audio(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::ToggleAudio { rsp: tx })?;
        rx.await?
    }

    /// Asks every connected participant to mute. Admin only
    pub async fn mute_all(&self) -> Result<Vec<ParticipantId>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::MuteAll { rsp: tx })?;
        rx.await?
    }

    /// Closes every connection. Admin only
    pub async fn remove_all(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::RemoveAll { rsp: tx })?;
        rx.await?
    }

    /// Polls membership right away instead of waiting for the next tick
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    pub async fn state(&self) -> Result<LifecycleState, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::GetState { rsp: tx })?;
        Ok(rx.await?)
    }

    pub async fn local_media(&self) -> Result<Option<LocalMediaState>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::GetLocalMedia { rsp: tx })?;
        Ok(rx.await?)
    }

    /// Peers with an entry in the connection table, pending or live
    pub async fn connected_peers(&self) -> Result<Vec<ParticipantId>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::GetConnectedPeers { rsp: tx })?;
        Ok(rx.await?)
    }
}

struct Receivers {
    poll_rx: UnboundedReceiver<PollEvent>,
    call_event_rx: UnboundedReceiver<CallEnvelope>,
    track_end_rx: UnboundedReceiver<String>,
}

struct Poller {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

struct ControllerTask {
    config: Config,
    broker: Arc<dyn ConnectionBroker>,
    membership: Arc<dyn MembershipSource>,
    capture: Arc<dyn MediaCapture>,
    render: Arc<dyn RenderSink>,

    state: LifecycleState,
    is_admin: bool,
    local: Option<LocalMediaState>,
    table: ConnectionTable,
    /// inbound calls that arrived before local media was ready
    pending_inbound: Vec<Arc<dyn PeerCall>>,
    poller: Option<Poller>,
    screen_hook: Option<JoinHandle<()>>,

    event_ch: broadcast::Sender<MeshEventKind>,
    refresh: Arc<Notify>,
    poll_tx: UnboundedSender<PollEvent>,
    call_event_tx: UnboundedSender<CallEnvelope>,
    track_end_tx: UnboundedSender<String>,
}

fn capture_denied(e: Error) -> Error {
    match e {
        Error::CaptureDenied(_) => e,
        other => Error::CaptureDenied(other.to_string()),
    }
}

async fn forward_call_events(
    peer_id: ParticipantId,
    serial: ConnectionId,
    mut events: CallEventStream,
    tx: UnboundedSender<CallEnvelope>,
) {
    loop {
        let event = events.next().await.unwrap_or(CallEvent::Closed);
        let closed = matches!(event, CallEvent::Closed);
        let envelope = CallEnvelope {
            peer_id: peer_id.clone(),
            serial,
            event,
        };
        if tx.send(envelope).is_err() || closed {
            break;
        }
    }
}

impl ControllerTask {
    fn new(
        args: Args,
        event_ch: broadcast::Sender<MeshEventKind>,
        refresh: Arc<Notify>,
    ) -> (Self, Receivers) {
        let Args {
            config,
            broker,
            membership,
            capture,
            render,
        } = args;

        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (call_event_tx, call_event_rx) = mpsc::unbounded_channel();
        let (track_end_tx, track_end_rx) = mpsc::unbounded_channel();

        let task = Self {
            is_admin: config.is_admin(),
            config,
            broker,
            membership,
            capture,
            render,
            state: LifecycleState::Idle,
            local: None,
            table: ConnectionTable::new(),
            pending_inbound: vec![],
            poller: None,
            screen_hook: None,
            event_ch,
            refresh,
            poll_tx,
            call_event_tx,
            track_end_tx,
        };

        let receivers = Receivers {
            poll_rx,
            call_event_rx,
            track_end_rx,
        };

        (task, receivers)
    }

    async fn run(
        mut self,
        mut cmd_rx: UnboundedReceiver<Cmd>,
        receivers: Receivers,
        token: CancellationToken,
    ) {
        let Receivers {
            mut poll_rx,
            mut call_event_rx,
            mut track_end_rx,
        } = receivers;

        let mut incoming = self.broker.incoming();
        let mut incoming_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("mesh controller dropped. leaving room");
                    self.leave().await;
                    break;
                }
                opt = cmd_rx.recv() => {
                    let cmd = match opt {
                        Some(r) => r,
                        None => {
                            tracing::debug!("mesh controller cmd channel is closed. quitting");
                            self.leave().await;
                            break;
                        }
                    };
                    self.handle_command(cmd).await;
                }
                opt = incoming.next(), if incoming_open => {
                    match opt {
                        Some(call) => self.accept(call).await,
                        None => {
                            tracing::debug!("incoming call stream ended");
                            incoming_open = false;
                        }
                    }
                }
                Some(envelope) = call_event_rx.recv() => {
                    self.handle_call_event(envelope).await;
                }
                Some(event) = poll_rx.recv() => {
                    self.handle_poll(event).await;
                }
                Some(track_id) = track_end_rx.recv() => {
                    self.handle_track_ended(track_id).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Join { rsp } => {
                let _ = rsp.send(self.join().await);
            }
            Cmd::Leave { rsp } => {
                self.leave().await;
                let _ = rsp.send(());
            }
            Cmd::Reconcile { members, rsp } => {
                let _ = rsp.send(self.reconcile(members).await);
            }
            Cmd::Initiate {
                peer_id,
                display_name,
                rsp,
            } => {
                let _ = rsp.send(self.initiate(&peer_id, &display_name).await);
            }
            Cmd::SwitchOutgoingVideo { track, source, rsp } => {
                let r = match self.ensure_joined() {
                    Ok(()) => self.switch_outgoing_video(track, source).await,
                    Err(e) => Err(e),
                };
                let _ = rsp.send(r);
            }
            Cmd::ShareScreen { rsp } => {
                let _ = rsp.send(self.share_screen().await);
            }
            Cmd::StopScreenShare { rsp } => {
                let _ = rsp.send(self.switch_to_camera().await);
            }
            Cmd::ToggleVideo { rsp } => {
                let _ = rsp.send(self.toggle(TrackKind::Video));
            }
            Cmd::ToggleAudio { rsp } => {
                let _ = rsp.send(self.toggle(TrackKind::Audio));
            }
            Cmd::MuteAll { rsp } => {
                let _ = rsp.send(self.mute_all());
            }
            Cmd::RemoveAll { rsp } => {
                let _ = rsp.send(self.remove_all().await);
            }
            Cmd::GetState { rsp } => {
                let _ = rsp.send(self.state);
            }
            Cmd::GetLocalMedia { rsp } => {
                let _ = rsp.send(self.local.clone());
            }
            Cmd::GetConnectedPeers { rsp } => {
                let _ = rsp.send(self.table.peers());
            }
        }
    }

    fn emit(&self, event: MeshEventKind) {
        let _ = self.event_ch.send(event);
    }

    fn ensure_joined(&self) -> Result<(), Error> {
        match self.state {
            LifecycleState::Joined => Ok(()),
            state => Err(Error::InvalidState { state }),
        }
    }

    async fn join(&mut self) -> Result<(), Error> {
        if self.state != LifecycleState::Idle {
            return Err(Error::InvalidState { state: self.state });
        }

        let stream = match self.capture.user_media(self.config.capture()).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to acquire local media: {e}");
                for call in std::mem::take(&mut self.pending_inbound) {
                    if let Err(e) = call.close().await {
                        tracing::debug!(
                            "failed to close held call from {}: {e}",
                            call.peer_id()
                        );
                    }
                }
                return Err(capture_denied(e));
            }
        };

        self.state = LifecycleState::MediaAcquired;
        let local = LocalMediaState::new(stream);
        let label = format!("{} (You)", self.config.display_name());
        self.render
            .render(self.config.local_id(), local.stream(), &label, true);
        self.local = Some(local);

        let token = CancellationToken::new();
        let handle = poller::spawn(
            self.membership.clone(),
            self.config.room_id().to_string(),
            self.config.poll_interval(),
            self.refresh.clone(),
            token.clone(),
            self.poll_tx.clone(),
        );
        self.poller = Some(Poller {
            token,
            _handle: handle,
        });

        self.state = LifecycleState::Joined;
        tracing::info!(
            "joined room {} as {}",
            self.config.room_id(),
            self.config.local_id()
        );
        self.emit(MeshEventKind::Joined {
            room_id: self.config.room_id().to_string(),
        });

        for call in std::mem::take(&mut self.pending_inbound) {
            self.accept(call).await;
        }

        Ok(())
    }

    async fn leave(&mut self) {
        let joined = match self.state {
            LifecycleState::Leaving | LifecycleState::Left => return,
            LifecycleState::Idle => false,
            LifecycleState::MediaAcquired | LifecycleState::Joined => true,
        };
        self.state = LifecycleState::Leaving;

        if let Some(poller) = self.poller.take() {
            poller.token.cancel();
        }

        if let Some(hook) = self.screen_hook.take() {
            hook.abort();
        }

        for call in std::mem::take(&mut self.pending_inbound) {
            if let Err(e) = call.close().await {
                tracing::debug!("failed to close pending call from {}: {e}", call.peer_id());
            }
        }

        for entry in self.table.drain() {
            let peer_id = entry.peer_id().clone();
            if let Err(e) = entry.connection().close().await {
                tracing::warn!("failed to close connection to {peer_id}: {e}");
            }
            self.render.remove(&peer_id);
        }

        if let Some(local) = self.local.as_ref() {
            local.release();
            self.render.remove(self.config.local_id());
        }

        if joined {
            if let Err(e) = self.membership.leave(self.config.room_id()).await {
                tracing::warn!("failed to notify room service of leave: {e}");
            }
        }

        self.state = LifecycleState::Left;
        tracing::info!("left room {}", self.config.room_id());
        self.emit(MeshEventKind::Left {
            room_id: self.config.room_id().to_string(),
        });
    }

    async fn handle_poll(&mut self, event: PollEvent) {
        match event {
            PollEvent::Members(members) => {
                if let Err(e) = self.reconcile(members).await {
                    tracing::debug!("skipping membership update: {e}");
                }
            }
            PollEvent::Failed(reason) => {
                self.emit(MeshEventKind::MembershipFetchFailed { reason });
            }
        }
    }

    async fn reconcile(
        &mut self,
        members: Vec<ParticipantRecord>,
    ) -> Result<Vec<ParticipantId>, Error> {
        self.ensure_joined()?;

        if let Some(record) = members.iter().find(|r| &r.id == self.config.local_id()) {
            if record.is_admin != self.is_admin {
                tracing::info!("admin flag changed to {}", record.is_admin);
                self.is_admin = record.is_admin;
            }
        }

        self.render.participants(&members);
        self.emit(MeshEventKind::MembershipUpdated {
            participants: members.clone(),
        });

        let missing = self
            .table
            .missing(self.config.local_id(), &members)
            .into_iter()
            .map(|record| (record.id.clone(), record.display_name.clone()))
            .collect::<Vec<_>>();

        let mut initiated = vec![];
        for (peer_id, display_name) in missing {
            match self.initiate(&peer_id, &display_name).await {
                Ok(true) => initiated.push(peer_id),
                Ok(false) => {}
                // logged and emitted by `initiate`. retried on the next pass
                Err(_) => {}
            }
        }
        Ok(initiated)
    }

    async fn initiate(
        &mut self,
        peer_id: &ParticipantId,
        display_name: &str,
    ) -> Result<bool, Error> {
        if peer_id == self.config.local_id() || self.table.contains(peer_id) {
            return Ok(false);
        }
        self.ensure_joined()?;
        let Some(local) = self.local.as_ref() else {
            return Err(Error::InvalidState { state: self.state });
        };

        let metadata = CallMetadata {
            user_name: Some(display_name.to_string()),
            caller_name: Some(self.config.display_name().to_string()),
        };
        let source = local.source_kind();

        let call = match self.broker.call(peer_id, local.stream(), metadata).await {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!("failed to call {peer_id}: {e}");
                self.emit(MeshEventKind::ConnectionFailed {
                    peer_id: peer_id.clone(),
                    reason: e.to_string(),
                });
                return Err(Error::ConnectionFailed {
                    peer: peer_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        tracing::debug!("calling {peer_id}");
        let events = call.events();
        self.register(call, events, display_name, source);
        self.emit(MeshEventKind::ParticipantConnecting {
            peer_id: peer_id.clone(),
        });
        Ok(true)
    }

    async fn accept(&mut self, call: Arc<dyn PeerCall>) {
        let peer_id = call.peer_id().clone();
        match self.state {
            LifecycleState::Idle | LifecycleState::MediaAcquired => {
                tracing::debug!("holding call from {peer_id} until joined");
                self.pending_inbound.push(call);
                return;
            }
            LifecycleState::Leaving | LifecycleState::Left => {
                if let Err(e) = call.close().await {
                    tracing::debug!("failed to close call from {peer_id}: {e}");
                }
                return;
            }
            LifecycleState::Joined => {}
        }

        if &peer_id == self.config.local_id() {
            tracing::warn!("closing call that claims to come from the local participant");
            let _ = call.close().await;
            return;
        }

        let Some((stream, source)) = self
            .local
            .as_ref()
            .map(|local| (local.stream().clone(), local.source_kind()))
        else {
            return;
        };

        let events = call.events();
        if let Err(e) = call.answer(&stream).await {
            tracing::warn!("failed to answer call from {peer_id}: {e}");
            let _ = call.close().await;
            self.emit(MeshEventKind::ConnectionFailed {
                peer_id,
                reason: e.to_string(),
            });
            return;
        }

        let label = call
            .metadata()
            .map(|metadata| metadata.label().to_string())
            .unwrap_or_else(|| DEFAULT_PARTICIPANT_LABEL.to_string());

        tracing::debug!("answered call from {peer_id}");
        if let Some(previous) = self.register(call, events, &label, source) {
            tracing::info!("call from {peer_id} replaces the existing connection");
            if let Err(e) = previous.connection().close().await {
                tracing::debug!("failed to close superseded connection to {peer_id}: {e}");
            }
            drop(previous);
            self.emit(MeshEventKind::ConnectionReplaced { peer_id });
        }
    }

    /// Inserts `call` into the table and starts relaying its events
    fn register(
        &mut self,
        call: Arc<dyn PeerCall>,
        events: CallEventStream,
        display_name: &str,
        source: TrackSource,
    ) -> Option<ConnectionEntry> {
        let peer_id = call.peer_id().clone();
        let (serial, superseded) = self.table.insert(call, display_name, source);
        let forwarder = tokio::spawn(forward_call_events(
            peer_id.clone(),
            serial,
            events,
            self.call_event_tx.clone(),
        ));
        if let Some(entry) = self.table.get_mut(&peer_id) {
            entry.attach_forwarder(forwarder);
        }
        superseded
    }

    async fn handle_call_event(&mut self, envelope: CallEnvelope) {
        let CallEnvelope {
            peer_id,
            serial,
            event,
        } = envelope;

        let (state, display_name) = match self.table.get(&peer_id) {
            Some(entry) if entry.serial() == serial => {
                (entry.state(), entry.display_name().to_string())
            }
            _ => {
                tracing::debug!("ignoring event from superseded connection to {peer_id}");
                return;
            }
        };

        match event {
            CallEvent::Stream(stream) => {
                if let Some(entry) = self.table.get_mut(&peer_id) {
                    entry.set_live();
                }
                self.render.render(&peer_id, &stream, &display_name, false);
                self.emit(MeshEventKind::ParticipantStream {
                    peer_id,
                    display_name,
                });
            }
            CallEvent::Error(reason) if state == EntryState::Live => {
                tracing::warn!("connection to {peer_id} reported an error: {reason}");
            }
            CallEvent::Error(reason) => {
                tracing::warn!("connection to {peer_id} failed: {reason}");
                if let Some(entry) = self.table.remove_if_current(&peer_id, serial) {
                    let _ = entry.connection().close().await;
                    // a superseded connection's view may still be on screen
                    self.render.remove(&peer_id);
                }
                self.emit(MeshEventKind::ConnectionFailed { peer_id, reason });
            }
            CallEvent::Closed => {
                tracing::debug!("connection to {peer_id} closed");
                self.table.remove_if_current(&peer_id, serial);
                self.render.remove(&peer_id);
                self.emit(MeshEventKind::ParticipantLeft { peer_id });
                self.refresh.notify_one();
            }
        }
    }

    async fn switch_outgoing_video(
        &mut self,
        track: Arc<dyn MediaTrack>,
        source: TrackSource,
    ) -> Result<(), Error> {
        if track.kind() != TrackKind::Video {
            return Err(Error::NoVideoTrack);
        }
        if self.local.is_none() {
            return Err(Error::InvalidState { state: self.state });
        }

        let report = switcher::replace_outgoing_video(&mut self.table, &track, source).await;
        for error in report.failed {
            tracing::warn!("{error}");
            if let Error::TrackReplaceFailed { peer, reason } = error {
                self.emit(MeshEventKind::TrackReplaceFailed {
                    peer_id: peer,
                    reason,
                });
            }
        }
        tracing::debug!(
            "outgoing video switched to {source} on {} connections",
            report.replaced.len()
        );

        match source {
            TrackSource::ScreenShare => self.watch_screen_share(&track),
            TrackSource::Camera => {
                if let Some(hook) = self.screen_hook.take() {
                    hook.abort();
                }
            }
        }

        if let Some(local) = self.local.as_mut() {
            for previous in local.replace_video_track(track, source) {
                previous.stop();
            }
        }

        self.emit(MeshEventKind::SourceChanged { source });
        Ok(())
    }

    async fn share_screen(&mut self) -> Result<(), Error> {
        self.ensure_joined()?;
        if self.source_kind() == Some(TrackSource::ScreenShare) {
            return Ok(());
        }

        let stream = self
            .capture
            .display_media()
            .await
            .map_err(capture_denied)?;
        let Some(track) = stream.first_video_track() else {
            stream.stop();
            return Err(Error::CaptureDenied("display capture has no video".into()));
        };
        for other in stream.tracks().iter().filter(|t| t.id() != track.id()) {
            other.stop();
        }

        self.switch_outgoing_video(track, TrackSource::ScreenShare)
            .await
    }

    async fn switch_to_camera(&mut self) -> Result<(), Error> {
        self.ensure_joined()?;
        if self.source_kind() == Some(TrackSource::Camera) {
            return Ok(());
        }

        let stream = self
            .capture
            .user_media(CaptureConstraints::video_only())
            .await
            .map_err(capture_denied)?;
        let Some(track) = stream.first_video_track() else {
            stream.stop();
            return Err(Error::CaptureDenied("camera capture has no video".into()));
        };
        for other in stream.tracks().iter().filter(|t| t.id() != track.id()) {
            other.stop();
        }

        self.switch_outgoing_video(track, TrackSource::Camera).await
    }

    fn source_kind(&self) -> Option<TrackSource> {
        self.local.as_ref().map(|local| local.source_kind())
    }

    /// Reports the end of `track` back to the controller
    fn watch_screen_share(&mut self, track: &Arc<dyn MediaTrack>) {
        let ended = track.ended();
        let track_id = track.id().to_string();
        let tx = self.track_end_tx.clone();
        let hook = tokio::spawn(async move {
            ended.await;
            let _ = tx.send(track_id);
        });
        if let Some(previous) = self.screen_hook.replace(hook) {
            previous.abort();
        }
    }

    async fn handle_track_ended(&mut self, track_id: String) {
        if self.state != LifecycleState::Joined {
            return;
        }

        let is_current_screen = self
            .local
            .as_ref()
            .filter(|local| local.source_kind() == TrackSource::ScreenShare)
            .and_then(|local| local.video_track())
            .map(|track| track.id() == track_id)
            .unwrap_or_default();

        if !is_current_screen {
            tracing::debug!("ignoring end of track {track_id}");
            return;
        }

        self.screen_hook = None;
        tracing::info!("screen share ended. switching back to camera");
        if let Err(e) = self.switch_to_camera().await {
            tracing::error!("failed to switch back to camera: {e}");
        }
    }

    fn toggle(&mut self, kind: TrackKind) -> Result<bool, Error> {
        let state = self.state;
        let Some(local) = self.local.as_mut() else {
            return Err(Error::InvalidState { state });
        };

        let enabled = match kind {
            TrackKind::Video => {
                let enabled = !local.video_enabled();
                local.set_video_enabled(enabled);
                enabled
            }
            TrackKind::Audio => {
                let enabled = !local.audio_enabled();
                local.set_audio_enabled(enabled);
                enabled
            }
        };

        let event = MeshEventKind::LocalMediaChanged {
            audio_enabled: local.audio_enabled(),
            video_enabled: local.video_enabled(),
        };
        self.emit(event);
        Ok(enabled)
    }

    fn mute_all(&self) -> Result<Vec<ParticipantId>, Error> {
        if !self.is_admin {
            return Err(Error::NotAdmin);
        }
        let peers = self.table.peers();
        for peer_id in &peers {
            self.emit(MeshEventKind::MuteRequested {
                peer_id: peer_id.clone(),
            });
        }
        Ok(peers)
    }

    async fn remove_all(&mut self) -> Result<(), Error> {
        if !self.is_admin {
            return Err(Error::NotAdmin);
        }
        for entry in self.table.drain() {
            let peer_id = entry.peer_id().clone();
            if let Err(e) = entry.connection().close().await {
                tracing::warn!("failed to close connection to {peer_id}: {e}");
            }
            self.render.remove(&peer_id);
            self.emit(MeshEventKind::ParticipantLeft { peer_id });
        }
        Ok(())
    }
}
