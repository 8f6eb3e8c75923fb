use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitSink;
use tokio::sync::Mutex;

use conflux_core::ids::{ConnectionId, MeetingId, ParticipantId};

pub type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Tracks the outbound half of every live signaling connection, keyed by
/// the connection id rather than participant id — a connection exists
/// before `join-room` binds it to a meeting/participant pair (§4.5). The
/// two index maps play the role of the reference stack's socket-index:
/// fast disconnect cleanup and fast relay/broadcast fan-out without asking
/// the meeting actor for a membership snapshot on every push.
pub struct WsStorage {
    connections: DashMap<ConnectionId, WsSender>,
    bindings: DashMap<ConnectionId, (MeetingId, ParticipantId)>,
    participant_index: DashMap<ParticipantId, ConnectionId>,
}

impl WsStorage {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            bindings: DashMap::new(),
            participant_index: DashMap::new(),
        }
    }

    pub fn add(&self, connection_id: ConnectionId, sender: WsSender) {
        self.connections.insert(connection_id, sender);
    }

    /// Removes a connection and any binding it held. Returns the
    /// `(meetingId, participantId)` it was bound to, if any, so the caller
    /// can run membership cleanup.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<(MeetingId, ParticipantId)> {
        self.connections.remove(connection_id);
        let bound = self.bindings.remove(connection_id).map(|(_, v)| v);
        if let Some((_, participant_id)) = &bound {
            self.participant_index.remove(participant_id);
        }
        bound
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<WsSender> {
        self.connections.get(connection_id).map(|s| s.clone())
    }

    /// Binds a connection to a meeting/participant pair on `join-room`. A
    /// connection may only be bound once; rebinding without a prior
    /// `unbind` overwrites the stale entry, matching the "second bind is
    /// an error at the handler level, not here" split of responsibility.
    pub fn bind(&self, connection_id: ConnectionId, meeting_id: MeetingId, participant_id: ParticipantId) {
        self.participant_index.insert(participant_id.clone(), connection_id.clone());
        self.bindings.insert(connection_id, (meeting_id, participant_id));
    }

    pub fn unbind(&self, connection_id: &ConnectionId) {
        if let Some((_, (_, participant_id))) = self.bindings.remove(connection_id) {
            self.participant_index.remove(&participant_id);
        }
    }

    pub fn binding_of(&self, connection_id: &ConnectionId) -> Option<(MeetingId, ParticipantId)> {
        self.bindings.get(connection_id).map(|b| b.clone())
    }

    pub fn connection_for_participant(&self, participant_id: &ParticipantId) -> Option<ConnectionId> {
        self.participant_index.get(participant_id).map(|c| c.clone())
    }

    pub fn connections_in_meeting(&self, meeting_id: &MeetingId) -> Vec<ConnectionId> {
        self.bindings
            .iter()
            .filter(|entry| &entry.value().0 == meeting_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for WsStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_populates_both_the_binding_and_the_participant_index() {
        let storage = WsStorage::new();
        let conn = ConnectionId::from("conn-1");
        let meeting = MeetingId::from("meeting-1");
        let participant = ParticipantId::from("alice");

        storage.bind(conn.clone(), meeting.clone(), participant.clone());

        assert_eq!(
            storage.binding_of(&conn),
            Some((meeting.clone(), participant.clone()))
        );
        assert_eq!(storage.connection_for_participant(&participant), Some(conn));
    }

    #[test]
    fn unbind_clears_the_participant_index_too() {
        let storage = WsStorage::new();
        let conn = ConnectionId::from("conn-1");
        let participant = ParticipantId::from("alice");
        storage.bind(conn.clone(), MeetingId::from("meeting-1"), participant.clone());

        storage.unbind(&conn);

        assert_eq!(storage.binding_of(&conn), None);
        assert_eq!(storage.connection_for_participant(&participant), None);
    }

    #[test]
    fn connections_in_meeting_only_returns_members_of_that_meeting() {
        let storage = WsStorage::new();
        let meeting_a = MeetingId::from("meeting-a");
        let meeting_b = MeetingId::from("meeting-b");

        storage.bind(
            ConnectionId::from("c1"),
            meeting_a.clone(),
            ParticipantId::from("alice"),
        );
        storage.bind(
            ConnectionId::from("c2"),
            meeting_a.clone(),
            ParticipantId::from("bob"),
        );
        storage.bind(
            ConnectionId::from("c3"),
            meeting_b.clone(),
            ParticipantId::from("carol"),
        );

        let mut in_a = storage.connections_in_meeting(&meeting_a);
        in_a.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(
            in_a,
            vec![ConnectionId::from("c1"), ConnectionId::from("c2")]
        );
        assert_eq!(
            storage.connections_in_meeting(&meeting_b),
            vec![ConnectionId::from("c3")]
        );
    }
}
