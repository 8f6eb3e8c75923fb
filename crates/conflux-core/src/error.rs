use thiserror::Error;

use crate::ids::{ConsumerId, MeetingId, ParticipantId, ProducerId};

/// Error taxonomy for the Meeting Lifecycle Manager, Hybrid Topology Engine
/// and P2P Coordinator. Media-backend and registry failures are distinct
/// leaf types (`conflux-media::RouterError`, `conflux-registry::RegistryError`)
/// and are wrapped here rather than flattened, so a caller can still match on
/// the originating subsystem.
#[derive(Debug, Error)]
pub enum MeetingError {
    #[error("meeting {0} not found")]
    MeetingNotFound(MeetingId),

    #[error("meeting {0} already exists")]
    MeetingAlreadyExists(MeetingId),

    #[error("meeting {meeting} is full ({max} participants)")]
    MeetingFull { meeting: MeetingId, max: u32 },

    #[error("participant {0} not found")]
    ParticipantNotFound(ParticipantId),

    #[error("participant {0} is already a member of this meeting")]
    ParticipantAlreadyJoined(ParticipantId),

    #[error("only the host may perform this action")]
    NotHost,

    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    #[error("a participant cannot consume their own producer")]
    SelfConsumptionRejected,

    #[error("relay target {relay_for} was not named as the offer's destination")]
    RelaySpoofRejected { relay_for: ParticipantId },

    #[error("topology transition already in progress for meeting {0}")]
    TransitionInProgress(MeetingId),

    #[error("topology transition timed out waiting for participant acknowledgements")]
    TransitionTimedOut,

    #[error("meeting actor mailbox closed unexpectedly")]
    MailboxClosed,

    #[error("media backend error: {0}")]
    Media(#[from] RouterError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Defined here (rather than in `conflux-media`) so both `conflux-core`'s
/// `MediaBackend` trait and `conflux-media`'s concrete mediasoup wrapper can
/// share one error type without a dependency cycle; `conflux-media`
/// re-exports this type as its public error.
#[derive(Debug, Error, Clone)]
pub enum RouterError {
    #[error("no media workers available")]
    NoWorkersAvailable,
    #[error("router creation failed: {0}")]
    RouterCreationFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("produce failed: {0}")]
    Produce(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("unsupported rtp capabilities")]
    UnsupportedCapabilities,
}

/// Mirrors `RouterError`'s role for `conflux-registry`'s `RoomRegistry` impl.
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot for {0} not found")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}
