use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use conflux_config::RedisSettings;
use conflux_core::error::RegistryError;
use conflux_core::ids::{ConnectionId, MeetingId, ParticipantId};
use conflux_core::registry::{RoomRegistry, RoomSnapshot};

/// 24h TTL refreshed on every write, so an abandoned snapshot (gateway
/// crashed without a clean `remove_snapshot`) ages out instead of lingering
/// forever as a "ghost" room in `list_snapshots`.
const SNAPSHOT_TTL_SECS: i64 = 24 * 60 * 60;
/// The socket index only needs to outlive a single connection's lifetime;
/// bounding it keeps a crash from leaking entries indefinitely.
const CONNECTION_INDEX_TTL_SECS: i64 = 6 * 60 * 60;
const ROOMS_INDEX_KEY: &str = "conflux:rooms";

fn room_key(meeting_id: &MeetingId) -> String {
    format!("conflux:room:{}", meeting_id.as_str())
}

fn connection_key(connection_id: &ConnectionId) -> String {
    format!("conflux:conn:{}", connection_id.as_str())
}

/// `RoomRegistry` backed by Redis, grounded the way the reference stack
/// grounds its `DaoError`-wrapping Mongo access: a thin async wrapper that
/// maps connection/serialization failures into the crate's own error type
/// rather than leaking `redis::RedisError` across the trait boundary.
pub struct RedisRoomRegistry {
    conn: ConnectionManager,
}

impl RedisRoomRegistry {
    pub async fn connect(settings: &RedisSettings) -> Result<Self, RegistryError> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RoomRegistry for RedisRoomRegistry {
    async fn put_snapshot(&self, snapshot: RoomSnapshot) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let key = room_key(&snapshot.meeting_id);
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;

        let _: () = conn
            .set_ex(&key, payload, SNAPSHOT_TTL_SECS as u64)
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        let _: () = conn
            .sadd(ROOMS_INDEX_KEY, snapshot.meeting_id.as_str())
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        debug!(meeting_id = %snapshot.meeting_id, "room snapshot written");
        Ok(())
    }

    async fn get_snapshot(&self, meeting_id: &MeetingId) -> Result<Option<RoomSnapshot>, RegistryError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(room_key(meeting_id))
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        match raw {
            Some(raw) => {
                let snapshot = serde_json::from_str(&raw)
                    .map_err(|e| RegistryError::Serialization(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn remove_snapshot(&self, meeting_id: &MeetingId) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(room_key(meeting_id))
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        let _: () = conn
            .srem(ROOMS_INDEX_KEY, meeting_id.as_str())
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<RoomSnapshot>, RegistryError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(ROOMS_INDEX_KEY)
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(snapshot) = self.get_snapshot(&MeetingId(id.clone())).await? {
                snapshots.push(snapshot);
            } else {
                // Snapshot TTL'd out from under the index; drop the stale
                // membership entry rather than returning a dangling id.
                let _: () = conn
                    .srem(ROOMS_INDEX_KEY, &id)
                    .await
                    .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
            }
        }
        Ok(snapshots)
    }

    async fn index_connection(
        &self,
        connection_id: &ConnectionId,
        meeting_id: &MeetingId,
        participant_id: &ParticipantId,
    ) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let value = format!("{}:{}", meeting_id.as_str(), participant_id.as_str());
        let _: () = conn
            .set_ex(connection_key(connection_id), value, CONNECTION_INDEX_TTL_SECS as u64)
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn lookup_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<(MeetingId, ParticipantId)>, RegistryError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(connection_key(connection_id))
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        Ok(raw.and_then(|raw| {
            let (meeting, participant) = raw.split_once(':')?;
            Some((MeetingId(meeting.to_string()), ParticipantId(participant.to_string())))
        }))
    }

    async fn remove_connection(&self, connection_id: &ConnectionId) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(connection_key(connection_id))
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
