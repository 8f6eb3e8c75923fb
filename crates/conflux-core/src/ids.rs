use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a newtype wrapper around a `String` identity, the way the
/// reference stack wraps every persisted entity id so a `ParticipantId`
/// and a `MeetingId` can never be swapped at a call site.
macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(MeetingId);
string_id!(ParticipantId);
string_id!(ProducerId);
string_id!(ConsumerId);
string_id!(TransportId);
string_id!(ConnectionId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_interchangeable_with_their_inner_string() {
        let a = ParticipantId::from("alice");
        let b = ParticipantId::from("alice".to_string());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "alice");
        assert_eq!(a.to_string(), "alice");
    }

    #[test]
    fn ids_serialize_as_bare_strings() {
        let id = MeetingId::from("room-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"room-42\"");
        let back: MeetingId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn distinct_id_types_do_not_compare_equal_by_value_alone() {
        // Same underlying string, different newtypes — a compile-time
        // guarantee this test merely documents: a ParticipantId and a
        // MeetingId can never be passed to each other's call sites.
        let participant = ParticipantId::from("room-1");
        let meeting = MeetingId::from("room-1");
        assert_eq!(participant.as_str(), meeting.as_str());
    }
}
