use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::ids::ParticipantId;
use crate::media_backend::MediaRouter;
use crate::model::TopologyModeTag;

/// The live topology state for a single meeting. Modeled as a tagged enum
/// rather than a class hierarchy: a meeting is always in exactly one of
/// these three states, and `Transitioning` carries the in-flight migration
/// bookkeeping instead of a separate "mode" flag plus nullable fields.
pub enum TopologyState {
    Mesh,
    Sfu {
        router: Arc<dyn MediaRouter>,
    },
    Transitioning {
        target: TopologyModeTag,
        /// Router is already created (pre-warmed or built at transition
        /// start) before participants are migrated onto it.
        router: Option<Arc<dyn MediaRouter>>,
        started_at: DateTime<Utc>,
        deadline_ms: u64,
        acked: HashSet<ParticipantId>,
    },
}

impl TopologyState {
    pub fn mode(&self) -> TopologyModeTag {
        match self {
            TopologyState::Mesh => TopologyModeTag::Mesh,
            TopologyState::Sfu { .. } => TopologyModeTag::Sfu,
            TopologyState::Transitioning { .. } => TopologyModeTag::Transitioning,
        }
    }

    pub fn router(&self) -> Option<&Arc<dyn MediaRouter>> {
        match self {
            TopologyState::Sfu { router } => Some(router),
            TopologyState::Transitioning { router, .. } => router.as_ref(),
            TopologyState::Mesh => None,
        }
    }
}
