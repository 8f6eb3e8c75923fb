use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::ids::{ConnectionId, MeetingId, ParticipantId};
use crate::model::TopologyModeTag;

/// The externally-visible, durable-enough-to-survive-a-gateway-restart view
/// of a meeting (§4.4 "Room Registry"). The in-process `MeetingActor` is the
/// source of truth for anything that needs single-writer serialization;
/// the registry exists so a second gateway process (or a reconnecting
/// client hitting a different instance) can discover which meetings exist
/// and route a socket back to the right one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub meeting_id: MeetingId,
    pub host_id: ParticipantId,
    pub mode: TopologyModeTag,
    pub participant_count: u32,
    pub created_at_epoch_ms: i64,
}

/// Implemented by `conflux-registry` over Redis; `conflux-core`'s own tests
/// use an in-memory fake so meeting-manager logic never needs a live Redis
/// instance.
#[async_trait]
pub trait RoomRegistry: Send + Sync {
    async fn put_snapshot(&self, snapshot: RoomSnapshot) -> Result<(), RegistryError>;

    async fn get_snapshot(&self, meeting_id: &MeetingId) -> Result<Option<RoomSnapshot>, RegistryError>;

    async fn remove_snapshot(&self, meeting_id: &MeetingId) -> Result<(), RegistryError>;

    async fn list_snapshots(&self) -> Result<Vec<RoomSnapshot>, RegistryError>;

    /// Socket index: maps a live signaling connection to the meeting and
    /// participant it belongs to, so a disconnect handler can look up what
    /// to clean up without having to scan every meeting.
    async fn index_connection(
        &self,
        connection_id: &ConnectionId,
        meeting_id: &MeetingId,
        participant_id: &ParticipantId,
    ) -> Result<(), RegistryError>;

    async fn lookup_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<(MeetingId, ParticipantId)>, RegistryError>;

    async fn remove_connection(&self, connection_id: &ConnectionId) -> Result<(), RegistryError>;
}

#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;

    use dashmap::DashMap;

    use super::*;

    #[derive(Default)]
    pub struct FakeRoomRegistry {
        rooms: DashMap<MeetingId, RoomSnapshot>,
        connections: Mutex<std::collections::HashMap<ConnectionId, (MeetingId, ParticipantId)>>,
    }

    #[async_trait]
    impl RoomRegistry for FakeRoomRegistry {
        async fn put_snapshot(&self, snapshot: RoomSnapshot) -> Result<(), RegistryError> {
            self.rooms.insert(snapshot.meeting_id.clone(), snapshot);
            Ok(())
        }

        async fn get_snapshot(
            &self,
            meeting_id: &MeetingId,
        ) -> Result<Option<RoomSnapshot>, RegistryError> {
            Ok(self.rooms.get(meeting_id).map(|r| r.clone()))
        }

        async fn remove_snapshot(&self, meeting_id: &MeetingId) -> Result<(), RegistryError> {
            self.rooms.remove(meeting_id);
            Ok(())
        }

        async fn list_snapshots(&self) -> Result<Vec<RoomSnapshot>, RegistryError> {
            Ok(self.rooms.iter().map(|r| r.clone()).collect())
        }

        async fn index_connection(
            &self,
            connection_id: &ConnectionId,
            meeting_id: &MeetingId,
            participant_id: &ParticipantId,
        ) -> Result<(), RegistryError> {
            self.connections.lock().unwrap().insert(
                connection_id.clone(),
                (meeting_id.clone(), participant_id.clone()),
            );
            Ok(())
        }

        async fn lookup_connection(
            &self,
            connection_id: &ConnectionId,
        ) -> Result<Option<(MeetingId, ParticipantId)>, RegistryError> {
            Ok(self.connections.lock().unwrap().get(connection_id).cloned())
        }

        async fn remove_connection(&self, connection_id: &ConnectionId) -> Result<(), RegistryError> {
            self.connections.lock().unwrap().remove(connection_id);
            Ok(())
        }
    }
}
