use std::collections::HashSet;

use crate::error::MeetingError;
use crate::ids::ParticipantId;

/// Validates a relayed signaling payload (offer/answer/ICE candidate)
/// before the gateway forwards it to its target, per §5's anti-spoofing
/// requirement: the sender must name the `relay_for` participant as the
/// intended recipient, and both ends must currently be members of the same
/// mesh meeting.
pub struct P2pCoordinator;

impl P2pCoordinator {
    /// `from` is the authenticated sender (taken from the connection, never
    /// from the payload body); `relay_for` is the participant the payload
    /// claims to be destined for.
    pub fn validate_relay(
        members: &HashSet<ParticipantId>,
        from: &ParticipantId,
        relay_for: &ParticipantId,
    ) -> Result<(), MeetingError> {
        if from == relay_for {
            return Err(MeetingError::RelaySpoofRejected {
                relay_for: relay_for.clone(),
            });
        }
        if !members.contains(from) {
            return Err(MeetingError::ParticipantNotFound(from.clone()));
        }
        if !members.contains(relay_for) {
            return Err(MeetingError::ParticipantNotFound(relay_for.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ParticipantId {
        ParticipantId(s.to_string())
    }

    #[test]
    fn rejects_self_relay() {
        let members: HashSet<_> = [id("a"), id("b")].into_iter().collect();
        let err = P2pCoordinator::validate_relay(&members, &id("a"), &id("a")).unwrap_err();
        assert!(matches!(err, MeetingError::RelaySpoofRejected { .. }));
    }

    #[test]
    fn rejects_relay_to_non_member() {
        let members: HashSet<_> = [id("a"), id("b")].into_iter().collect();
        let err = P2pCoordinator::validate_relay(&members, &id("a"), &id("c")).unwrap_err();
        assert!(matches!(err, MeetingError::ParticipantNotFound(_)));
    }

    #[test]
    fn accepts_valid_relay() {
        let members: HashSet<_> = [id("a"), id("b")].into_iter().collect();
        assert!(P2pCoordinator::validate_relay(&members, &id("a"), &id("b")).is_ok());
    }
}
