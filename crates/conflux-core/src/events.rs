use tokio::sync::broadcast;

use crate::ids::{ConsumerId, ParticipantId, ProducerId};
use crate::model::{MediaState, TopologyModeTag, TransitionReason};

/// Membership changes, fanned out to every signaling connection attached to
/// a meeting. The gateway's WS dispatcher subscribes one receiver per
/// socket, the way the reference stack's `dispatcher.rs` holds one
/// `broadcast::Sender` per room and relies on `tokio::sync::broadcast` to
/// drop events a slow consumer can't keep up with rather than block the
/// meeting actor.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    ParticipantJoined {
        participant_id: ParticipantId,
        display_name: Option<String>,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    ParticipantSuspended {
        participant_id: ParticipantId,
    },
    ParticipantResumed {
        participant_id: ParticipantId,
    },
    MediaStateChanged {
        participant_id: ParticipantId,
        state: MediaState,
    },
    HostTransferred {
        new_host: ParticipantId,
    },
}

/// Topology-level events: the gateway uses these to drive client-visible
/// `modeTransitionStarted` / `modeTransitionComplete` pushes.
#[derive(Debug, Clone)]
pub enum TransitionEvent {
    Started {
        from: TopologyModeTag,
        to: TopologyModeTag,
        reason: TransitionReason,
        deadline_ms: u64,
    },
    ParticipantAcked {
        participant_id: ParticipantId,
    },
    Completed {
        mode: TopologyModeTag,
    },
    Aborted {
        reason: String,
    },
}

/// Active-speaker observer output (§4.3): at most the configured top-k
/// speakers, already rate-limited by the producer of this event.
#[derive(Debug, Clone)]
pub struct ActiveSpeakerEvent {
    pub speakers: Vec<ParticipantId>,
}

/// Periodic media statistics, one event per producer/consumer per
/// collection tick.
#[derive(Debug, Clone)]
pub enum StatsEvent {
    Producer {
        producer_id: ProducerId,
        owner: ParticipantId,
        bitrate_bps: u32,
        packet_loss_pct: f32,
    },
    Consumer {
        consumer_id: ConsumerId,
        owner: ParticipantId,
        bitrate_bps: u32,
        packet_loss_pct: f32,
        rtt_ms: u32,
    },
}

/// The broadcast channels a single meeting actor owns. Separate typed
/// channels (rather than one enum of everything) keep a subscriber that
/// only cares about membership from being woken on every stats tick.
pub struct MeetingEventBus {
    pub membership: broadcast::Sender<MembershipEvent>,
    pub transitions: broadcast::Sender<TransitionEvent>,
    pub active_speaker: broadcast::Sender<ActiveSpeakerEvent>,
    pub stats: broadcast::Sender<StatsEvent>,
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

impl MeetingEventBus {
    pub fn new() -> Self {
        Self {
            membership: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            transitions: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            active_speaker: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            stats: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
        }
    }
}

impl Default for MeetingEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience bundle of the four subscriber handles for a meeting, handed
/// to a newly-joined signaling connection.
pub struct MeetingSubscribers {
    pub membership: broadcast::Receiver<MembershipEvent>,
    pub transitions: broadcast::Receiver<TransitionEvent>,
    pub active_speaker: broadcast::Receiver<ActiveSpeakerEvent>,
    pub stats: broadcast::Receiver<StatsEvent>,
}

impl MeetingEventBus {
    pub fn subscribe_all(&self) -> MeetingSubscribers {
        MeetingSubscribers {
            membership: self.membership.subscribe(),
            transitions: self.transitions.subscribe(),
            active_speaker: self.active_speaker.subscribe(),
            stats: self.stats.subscribe(),
        }
    }
}
