use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use derive_more::Display;
use tokio::task::JoinHandle;

use super::{ParticipantId, ParticipantRecord, PeerCall, TrackSource};

/// Serial assigned by the table to every connection it stores. Events
/// tagged with a serial that no longer matches the entry are stale
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Opened, remote media not received yet
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "live")]
    Live,
}

pub struct ConnectionEntry {
    peer_id: ParticipantId,
    connection: Arc<dyn PeerCall>,
    outgoing_track_kind: TrackSource,
    state: EntryState,
    serial: ConnectionId,
    display_name: String,
    forwarder: Option<JoinHandle<()>>,
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("peer_id", &self.peer_id)
            .field("outgoing_track_kind", &self.outgoing_track_kind)
            .field("state", &self.state)
            .field("serial", &self.serial)
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl ConnectionEntry {
    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    pub fn connection(&self) -> &Arc<dyn PeerCall> {
        &self.connection
    }

    pub fn outgoing_track_kind(&self) -> TrackSource {
        self.outgoing_track_kind
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn serial(&self) -> ConnectionId {
        self.serial
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub(crate) fn set_live(&mut self) {
        self.state = EntryState::Live;
    }

    pub(crate) fn set_outgoing_track_kind(&mut self, kind: TrackSource) {
        self.outgoing_track_kind = kind;
    }

    /// Ties the task relaying this connection's events to the entry's lifetime
    pub(crate) fn attach_forwarder(&mut self, forwarder: JoinHandle<()>) {
        if let Some(previous) = self.forwarder.replace(forwarder) {
            previous.abort();
        }
    }
}

/// Live and pending connections, keyed by remote participant.
/// Holds at most one entry per participant
#[derive(Default)]
pub struct ConnectionTable {
    entries: HashMap<ParticipantId, ConnectionEntry>,
    next_serial: u64,
}

impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.values()).finish()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, peer_id: &ParticipantId) -> bool {
        self.entries.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &ParticipantId) -> Option<&ConnectionEntry> {
        self.entries.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &ParticipantId) -> Option<&mut ConnectionEntry> {
        self.entries.get_mut(peer_id)
    }

    pub fn peers(&self) -> Vec<ParticipantId> {
        let mut peers = self.entries.keys().cloned().collect::<Vec<_>>();
        peers.sort();
        peers
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionEntry> {
        self.entries.values_mut()
    }

    /// Stores `connection` as the entry for its peer in the `Connecting`
    /// state. An entry already present for the peer is handed back so the
    /// caller can close it
    pub fn insert(
        &mut self,
        connection: Arc<dyn PeerCall>,
        display_name: &str,
        outgoing_track_kind: TrackSource,
    ) -> (ConnectionId, Option<ConnectionEntry>) {
        self.next_serial += 1;
        let serial = ConnectionId(self.next_serial);
        let peer_id = connection.peer_id().clone();
        let entry = ConnectionEntry {
            peer_id: peer_id.clone(),
            connection,
            outgoing_track_kind,
            state: EntryState::Connecting,
            serial,
            display_name: display_name.into(),
            forwarder: None,
        };
        let superseded = self.entries.insert(peer_id, entry);
        (serial, superseded)
    }

    pub fn remove(&mut self, peer_id: &ParticipantId) -> Option<ConnectionEntry> {
        self.entries.remove(peer_id)
    }

    /// Removes the entry for `peer_id` only if it still holds the connection
    /// identified by `serial`
    pub fn remove_if_current(
        &mut self,
        peer_id: &ParticipantId,
        serial: ConnectionId,
    ) -> Option<ConnectionEntry> {
        match self.entries.get(peer_id) {
            Some(entry) if entry.serial == serial => self.entries.remove(peer_id),
            _ => None,
        }
    }

    pub fn drain(&mut self) -> Vec<ConnectionEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    /// Members of the room we hold no connection to, in membership order.
    /// Skips `local_id` and collapses repeated ids
    pub fn missing<'a>(
        &self,
        local_id: &ParticipantId,
        members: &'a [ParticipantRecord],
    ) -> Vec<&'a ParticipantRecord> {
        let mut seen = HashSet::new();
        members
            .iter()
            .filter(|record| &record.id != local_id)
            .filter(|record| !self.entries.contains_key(&record.id))
            .filter(|record| seen.insert(record.id.clone()))
            .collect()
    }
}
