use serde::{Deserialize, Serialize};

use conflux_core::ids::{ConsumerId, ParticipantId, ProducerId, TransportId};
use conflux_core::model::{MediaState, PreferredLayers, ProducerKind, SourceTag, TopologyModeTag};

/// The client→server wire shapes from §4.5: a `Request` carries an `id` and
/// expects exactly one reply with the same id; everything else here is
/// fire-and-forget. Tagged on `type` with the payload nested under `data`,
/// matching the reference stack's `ClientSignal`/`ServerSignal` JSON shape.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "join-room")]
    JoinRoom { display_name: Option<String> },
    #[serde(rename = "leave-room")]
    LeaveRoom,

    // P2P relay (mesh topology only).
    Offer { to_peer_id: ParticipantId, sdp: serde_json::Value },
    Answer { to_peer_id: ParticipantId, sdp: serde_json::Value },
    #[serde(rename = "ice-candidate")]
    IceCandidate { to_peer_id: ParticipantId, candidate: serde_json::Value },

    #[serde(rename = "media-state-changed")]
    MediaStateChanged { state: MediaState },
    #[serde(rename = "transition-acknowledged")]
    TransitionAcknowledged,
    #[serde(rename = "request-connection-refresh")]
    RequestConnectionRefresh,

    // SFU suite.
    GetRouterCapabilities,
    SetRtpCapabilities { rtp_capabilities: serde_json::Value },
    CreateTransport,
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: serde_json::Value,
    },
    Produce {
        transport_id: TransportId,
        kind: ProducerKind,
        source: SourceTag,
        rtp_parameters: serde_json::Value,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: serde_json::Value,
    },
    PauseProducer { producer_id: ProducerId },
    ResumeProducer { producer_id: ProducerId },
    PauseConsumer { consumer_id: ConsumerId },
    ResumeConsumer { consumer_id: ConsumerId },
    SetPreferredLayers {
        consumer_id: ConsumerId,
        layers: PreferredLayers,
    },
    SetPriority { consumer_id: ConsumerId, priority: u8 },
    RestartIce { transport_id: TransportId },
    GetStats,

    Heartbeat,
}

/// Server→client push/reply shapes, also tagged on `type`/`data`. A reply to
/// a `Request` is sent as `Reply` with the original `id`; everything else is
/// a `Push` with no `id`.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerPush {
    #[serde(rename = "peer-joined")]
    PeerJoined {
        participant_id: ParticipantId,
        display_name: Option<String>,
    },
    #[serde(rename = "peer-left")]
    PeerLeft { participant_id: ParticipantId },
    #[serde(rename = "media-state-changed")]
    MediaStateChanged {
        participant_id: ParticipantId,
        state: MediaState,
    },
    #[serde(rename = "new-producer")]
    NewProducer {
        participant_id: ParticipantId,
        producer_id: ProducerId,
        kind: ProducerKind,
    },
    #[serde(rename = "new-consumer")]
    NewConsumer {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: ProducerKind,
        rtp_parameters: serde_json::Value,
    },
    #[serde(rename = "active-speakers")]
    ActiveSpeakers { participant_ids: Vec<ParticipantId> },
    #[serde(rename = "transition-started")]
    TransitionStarted {
        from: TopologyModeTag,
        to: TopologyModeTag,
        deadline_ms: u64,
    },
    #[serde(rename = "transition-info")]
    TransitionInfo { acked_count: u32, total: u32 },
    #[serde(rename = "transition-completed")]
    TransitionCompleted { mode: TopologyModeTag },
    #[serde(rename = "transition-failed")]
    TransitionFailed { reason: String },
    #[serde(rename = "meeting-ended")]
    MeetingEnded { reason: String },

    // Relayed P2P payloads carry the originating peer so the recipient
    // can attribute the offer/answer/candidate.
    Offer { from_peer_id: ParticipantId, sdp: serde_json::Value },
    Answer { from_peer_id: ParticipantId, sdp: serde_json::Value },
    #[serde(rename = "ice-candidate")]
    IceCandidate { from_peer_id: ParticipantId, candidate: serde_json::Value },

    Connected { participant_id: ParticipantId },
    Pong,
}

/// A framed envelope: requests carry `id`, pushes/fire-and-forget don't.
/// Deserialized manually in the handler rather than derived, since the
/// `id` field sits alongside the tagged `type`/`data` pair rather than
/// inside it.
#[derive(Debug, Deserialize)]
pub struct IncomingFrame {
    pub id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[derive(Debug, Serialize)]
pub struct OutgoingReply {
    pub id: String,
    #[serde(flatten)]
    pub result: ReplyResult,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReplyResult {
    Ok { data: serde_json::Value },
    Err { error: String },
}

#[derive(Debug, Serialize)]
pub struct OutgoingPush {
    #[serde(flatten)]
    pub push: ServerPush,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_frame_flattens_id_alongside_the_tagged_message() {
        let frame: IncomingFrame = serde_json::from_str(
            r#"{"id":"req-1","type":"join-room","data":{"displayName":"Alice"}}"#,
        )
        .unwrap();

        assert_eq!(frame.id.as_deref(), Some("req-1"));
        match frame.message {
            ClientMessage::JoinRoom { display_name } => {
                assert_eq!(display_name.as_deref(), Some("Alice"));
            }
            other => panic!("expected JoinRoom, got {other:?}"),
        }
    }

    #[test]
    fn fire_and_forget_messages_have_no_id() {
        let frame: IncomingFrame =
            serde_json::from_str(r#"{"id":null,"type":"heartbeat"}"#).unwrap();
        assert_eq!(frame.id, None);
        assert!(matches!(frame.message, ClientMessage::Heartbeat));
    }

    #[test]
    fn produce_parses_camel_case_fields_into_snake_case_struct_fields() {
        let frame: IncomingFrame = serde_json::from_str(
            r#"{"id":"req-2","type":"produce","data":{"transportId":"t1","kind":"video","source":"camera","rtpParameters":{}}}"#,
        )
        .unwrap();

        match frame.message {
            ClientMessage::Produce {
                transport_id,
                kind,
                source,
                ..
            } => {
                assert_eq!(transport_id, TransportId::from("t1"));
                assert_eq!(kind, ProducerKind::Video);
                assert_eq!(source, SourceTag::Camera);
            }
            other => panic!("expected Produce, got {other:?}"),
        }
    }

    #[test]
    fn server_push_serializes_with_kebab_case_type_tags() {
        let push = ServerPush::PeerJoined {
            participant_id: ParticipantId::from("alice"),
            display_name: Some("Alice".to_string()),
        };
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["type"], "peer-joined");
        assert_eq!(json["data"]["participantId"], "alice");
    }

    #[test]
    fn reply_result_is_untagged_ok_or_err() {
        let ok = OutgoingReply {
            id: "req-1".to_string(),
            result: ReplyResult::Ok {
                data: serde_json::json!({"foo": "bar"}),
            },
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["data"]["foo"], "bar");
        assert!(json.get("error").is_none());

        let err = OutgoingReply {
            id: "req-2".to_string(),
            result: ReplyResult::Err {
                error: "not found".to_string(),
            },
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"], "not found");
        assert!(json.get("data").is_none());
    }
}
