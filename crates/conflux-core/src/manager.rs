use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use conflux_config::TopologySettings;

use crate::actor::{MeetingActor, MeetingHandle};
use crate::error::MeetingError;
use crate::ids::{MeetingId, ParticipantId};
use crate::media_backend::MediaBackendFactory;
use crate::model::{MeetingOptions, TopologyModeTag};
use crate::error::RegistryError;
use crate::registry::{RoomRegistry, RoomSnapshot};

/// Owns the set of live meeting actors for this gateway process, the way
/// the reference stack's `RoomManager` owns a map of `MediaRoom`s — except
/// each entry here is a `MeetingHandle` pointing at its own task rather
/// than a struct guarded by a shared lock.
pub struct MeetingManager {
    meetings: DashMap<MeetingId, MeetingHandle>,
    media_factory: Arc<dyn MediaBackendFactory>,
    registry: Arc<dyn RoomRegistry>,
    settings: TopologySettings,
}

impl MeetingManager {
    pub fn new(
        media_factory: Arc<dyn MediaBackendFactory>,
        registry: Arc<dyn RoomRegistry>,
        settings: TopologySettings,
    ) -> Self {
        Self {
            meetings: DashMap::new(),
            media_factory,
            registry,
            settings,
        }
    }

    pub async fn create_meeting(
        &self,
        meeting_id: MeetingId,
        host_id: ParticipantId,
        host_display_name: Option<String>,
        options: MeetingOptions,
    ) -> Result<MeetingHandle, MeetingError> {
        if self.meetings.contains_key(&meeting_id) {
            return Err(MeetingError::MeetingAlreadyExists(meeting_id));
        }

        let handle = MeetingActor::spawn(
            meeting_id.clone(),
            host_id.clone(),
            host_display_name,
            options,
            self.media_factory.clone(),
            self.settings.clone(),
        );

        self.meetings.insert(meeting_id.clone(), handle.clone());

        self.registry
            .put_snapshot(RoomSnapshot {
                meeting_id,
                host_id,
                mode: TopologyModeTag::Mesh,
                participant_count: 1,
                created_at_epoch_ms: chrono::Utc::now().timestamp_millis(),
            })
            .await?;

        Ok(handle)
    }

    pub fn get(&self, meeting_id: &MeetingId) -> Result<MeetingHandle, MeetingError> {
        self.meetings
            .get(meeting_id)
            .map(|h| h.clone())
            .ok_or_else(|| MeetingError::MeetingNotFound(meeting_id.clone()))
    }

    pub async fn end_meeting(&self, meeting_id: &MeetingId) -> Result<(), MeetingError> {
        let (_, handle) = self
            .meetings
            .remove(meeting_id)
            .ok_or_else(|| MeetingError::MeetingNotFound(meeting_id.clone()))?;
        handle.shutdown().await;
        self.registry.remove_snapshot(meeting_id).await?;
        info!(%meeting_id, "meeting ended");
        Ok(())
    }

    pub async fn refresh_snapshot(&self, meeting_id: &MeetingId) -> Result<(), MeetingError> {
        let handle = self.get(meeting_id)?;
        let snap = handle.snapshot().await?;
        self.registry
            .put_snapshot(RoomSnapshot {
                meeting_id: snap.id,
                host_id: snap.host_id,
                mode: snap.mode,
                participant_count: snap.participant_ids.len() as u32,
                created_at_epoch_ms: snap.created_at.timestamp_millis(),
            })
            .await?;
        Ok(())
    }

    /// Registry listing for the admin `GET /rooms` surface. Reads the
    /// registry directly rather than polling every live actor, so it stays
    /// correct across a multi-instance deployment (§4.6).
    pub async fn list_snapshots(&self) -> Result<Vec<RoomSnapshot>, RegistryError> {
        self.registry.list_snapshots().await
    }

    pub async fn get_snapshot(&self, meeting_id: &MeetingId) -> Result<Option<RoomSnapshot>, RegistryError> {
        self.registry.get_snapshot(meeting_id).await
    }

    /// Broadcasts a dead media worker to every live meeting so whichever
    /// one was actually routed through it can reallocate (§4.7).
    pub async fn reconcile_all_routers(&self, dead_worker_tag: String) {
        let handles: Vec<MeetingHandle> = self.meetings.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.notify_worker_lost(dead_worker_tag.clone()).await;
        }
    }

    pub fn len(&self) -> usize {
        self.meetings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meetings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_backend::fake::FakeMediaBackendFactory;
    use crate::registry::fake::FakeRoomRegistry;

    fn settings() -> TopologySettings {
        TopologySettings {
            p2p_threshold: 3,
            sfu_threshold: 4,
            transition_timeout_ms: 2000,
            min_time_between_transitions_ms: 10_000,
            quality_check_interval_ms: 60_000,
            poor_quality_packet_loss_pct: 5.0,
            poor_quality_rtt_ms: 200,
            ghost_grace_ms: 15_000,
            heartbeat_interval_ms: 30_000,
            prewarm_idle_timeout_ms: 60_000,
        }
    }

    fn manager() -> MeetingManager {
        MeetingManager::new(
            Arc::new(FakeMediaBackendFactory),
            Arc::new(FakeRoomRegistry::default()),
            settings(),
        )
    }

    #[tokio::test]
    async fn create_meeting_rejects_a_duplicate_id() {
        let manager = manager();
        let meeting_id = MeetingId::from("room-1");

        manager
            .create_meeting(
                meeting_id.clone(),
                ParticipantId::from("host"),
                None,
                MeetingOptions::default(),
            )
            .await
            .unwrap();

        let result = manager
            .create_meeting(
                meeting_id,
                ParticipantId::from("someone-else"),
                None,
                MeetingOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(MeetingError::MeetingAlreadyExists(_))));
    }

    #[tokio::test]
    async fn end_meeting_removes_it_from_both_the_live_map_and_the_registry() {
        let manager = manager();
        let meeting_id = MeetingId::from("room-1");
        manager
            .create_meeting(
                meeting_id.clone(),
                ParticipantId::from("host"),
                None,
                MeetingOptions::default(),
            )
            .await
            .unwrap();

        manager.end_meeting(&meeting_id).await.unwrap();

        assert!(matches!(
            manager.get(&meeting_id),
            Err(MeetingError::MeetingNotFound(_))
        ));
        assert!(manager.get_snapshot(&meeting_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_snapshots_reflects_every_created_meeting() {
        let manager = manager();
        manager
            .create_meeting(
                MeetingId::from("room-1"),
                ParticipantId::from("host-1"),
                None,
                MeetingOptions::default(),
            )
            .await
            .unwrap();
        manager
            .create_meeting(
                MeetingId::from("room-2"),
                ParticipantId::from("host-2"),
                None,
                MeetingOptions::default(),
            )
            .await
            .unwrap();

        let snapshots = manager.list_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 2);
    }
}
