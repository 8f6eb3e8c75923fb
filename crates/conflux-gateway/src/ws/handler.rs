use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conflux_core::actor::MeetingHandle;
use conflux_core::events::{ActiveSpeakerEvent, MembershipEvent, TransitionEvent};
use conflux_core::ids::{ConnectionId, MeetingId, ParticipantId, ProducerId};
use conflux_core::model::ProducerKind;
use conflux_core::p2p::P2pCoordinator;

use crate::error::GatewayError;
use crate::state::AppState;

use super::protocol::{ClientMessage, IncomingFrame, OutgoingReply, ReplyResult, ServerPush};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
    pub meeting_id: String,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match state.auth.verify(&params.token).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let meeting_id = MeetingId::from(params.meeting_id);
    let participant_id = ParticipantId::from(identity.identity);

    ws.on_upgrade(move |socket| handle_socket(socket, state, meeting_id, participant_id))
}

/// Per-connection state the dispatcher needs between frames. A connection
/// is bound to at most one meeting/participant for its lifetime — §4.5
/// forbids rebinding, so `joined` just guards against a duplicate
/// `join-room`.
struct ConnState {
    connection_id: ConnectionId,
    meeting_id: MeetingId,
    participant_id: ParticipantId,
    joined: bool,
    fanout: Option<tokio::task::JoinHandle<()>>,
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    meeting_id: MeetingId,
    participant_id: ParticipantId,
) {
    let connection_id = ConnectionId::from(Uuid::new_v4().to_string());
    info!(%connection_id, %participant_id, %meeting_id, "WS connected");

    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));
    state.ws_storage.add(connection_id.clone(), sender.clone());

    super::dispatcher::send_push(
        &state.ws_storage,
        &connection_id,
        ServerPush::Connected {
            participant_id: participant_id.clone(),
        },
    )
    .await;

    let mut conn = ConnState {
        connection_id: connection_id.clone(),
        meeting_id,
        participant_id,
        joined: false,
        fanout: None,
    };

    // Server-initiated heartbeat (§4.5): ping every `heartbeat_interval_ms`
    // and terminate the connection after two consecutive misses, the same
    // way `ghost_grace_ms` bounds how long a disconnected participant's
    // seat is held open.
    let heartbeat_interval_ms = state.settings.topology.heartbeat_interval_ms;
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
    heartbeat.tick().await; // first tick fires immediately; consume it
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&state, &mut conn, &sender, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let mut guard = sender.lock().await;
                        let _ = guard.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%connection_id, %e, "WS error");
                        break;
                    }
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if missed_pongs >= 2 {
                    warn!(%connection_id, "missed two heartbeats; closing connection");
                    let mut guard = sender.lock().await;
                    let _ = guard.send(Message::Close(None)).await;
                    break;
                }
                missed_pongs += 1;
                let mut guard = sender.lock().await;
                if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(fanout) = conn.fanout.take() {
        fanout.abort();
    }
    state.ws_storage.remove(&connection_id);

    if conn.joined {
        let meeting_id = conn.meeting_id.clone();
        let participant_id = conn.participant_id.clone();
        if let Ok(handle) = state.meetings.get(&meeting_id) {
            let _ = handle.suspend(participant_id.clone()).await;
            let ghost_grace_ms = state.settings.topology.ghost_grace_ms;
            let meetings = state.meetings.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ghost_grace_ms)).await;
                if let Ok(handle) = meetings.get(&meeting_id) {
                    let _ = handle.finalize_if_suspended(participant_id).await;
                }
            });
        }
    }

    info!(%connection_id, "WS disconnected");
}

type WsSender = Arc<Mutex<futures::stream::SplitSink<WebSocket, Message>>>;

async fn handle_text_frame(state: &AppState, conn: &mut ConnState, sender: &WsSender, text: &str) {
    let frame: IncomingFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(%e, "malformed WS frame");
            return;
        }
    };

    let request_id = frame.id;
    let result = dispatch(state, conn, frame.message).await;

    let Some(id) = request_id else {
        if let Err(e) = result {
            debug!(connection_id = %conn.connection_id, %e, "fire-and-forget message failed");
        }
        return;
    };

    let reply = OutgoingReply {
        id,
        result: match result {
            Ok(data) => ReplyResult::Ok { data },
            Err(e) => ReplyResult::Err { error: e.message() },
        },
    };
    let text = serde_json::to_string(&reply).unwrap_or_default();
    let mut guard = sender.lock().await;
    let _ = guard.send(Message::text(text)).await;
}

async fn dispatch(
    state: &AppState,
    conn: &mut ConnState,
    message: ClientMessage,
) -> Result<serde_json::Value, GatewayError> {
    match message {
        ClientMessage::JoinRoom { display_name } => {
            if conn.joined {
                return Err(GatewayError::Conflict("connection already bound to a meeting".into()));
            }
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle
                .join(conn.participant_id.clone(), display_name.clone(), false)
                .await?;

            state.ws_storage.bind(
                conn.connection_id.clone(),
                conn.meeting_id.clone(),
                conn.participant_id.clone(),
            );
            conn.joined = true;
            conn.fanout = Some(spawn_fanout(state.clone(), handle.clone(), conn));

            state.meetings.refresh_snapshot(&conn.meeting_id).await?;

            super::dispatcher::broadcast_to_meeting(
                &state.ws_storage,
                &conn.meeting_id,
                ServerPush::PeerJoined {
                    participant_id: conn.participant_id.clone(),
                    display_name,
                },
                Some(&conn.connection_id),
            )
            .await;

            Ok(serde_json::json!({ "participantId": conn.participant_id.0 }))
        }

        ClientMessage::LeaveRoom => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle.leave(conn.participant_id.clone()).await?;
            finish_leave(state, conn).await;
            Ok(serde_json::Value::Null)
        }

        ClientMessage::Offer { to_peer_id, sdp } => {
            relay(state, conn, to_peer_id, |from_peer_id| ServerPush::Offer { from_peer_id, sdp }).await
        }
        ClientMessage::Answer { to_peer_id, sdp } => {
            relay(state, conn, to_peer_id, |from_peer_id| ServerPush::Answer { from_peer_id, sdp }).await
        }
        ClientMessage::IceCandidate { to_peer_id, candidate } => {
            relay(state, conn, to_peer_id, |from_peer_id| ServerPush::IceCandidate {
                from_peer_id,
                candidate,
            })
            .await
        }

        ClientMessage::MediaStateChanged { state: media_state } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle
                .set_media_state(conn.participant_id.clone(), media_state.clone())
                .await?;
            super::dispatcher::broadcast_to_meeting(
                &state.ws_storage,
                &conn.meeting_id,
                ServerPush::MediaStateChanged {
                    participant_id: conn.participant_id.clone(),
                    state: media_state,
                },
                Some(&conn.connection_id),
            )
            .await;
            Ok(serde_json::Value::Null)
        }

        ClientMessage::TransitionAcknowledged => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle.ack_transition(conn.participant_id.clone()).await?;
            Ok(serde_json::Value::Null)
        }

        ClientMessage::RequestConnectionRefresh => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            let caps = handle.router_capabilities().await?;
            Ok(caps)
        }

        ClientMessage::GetRouterCapabilities => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            let caps = handle.router_capabilities().await?;
            Ok(caps)
        }

        ClientMessage::SetRtpCapabilities { rtp_capabilities } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle
                .set_rtp_capabilities(conn.participant_id.clone(), rtp_capabilities.clone())
                .await?;

            catch_up_consumers(state, conn, &handle, rtp_capabilities).await;

            Ok(serde_json::Value::Null)
        }

        ClientMessage::CreateTransport => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            let descriptor = handle.create_transport(conn.participant_id.clone()).await?;
            Ok(serde_json::to_value(descriptor).unwrap_or_default())
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle.connect_transport(transport_id, dtls_parameters).await?;
            Ok(serde_json::Value::Null)
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            source,
            rtp_parameters,
        } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            let descriptor = handle
                .produce(conn.participant_id.clone(), transport_id, kind, source, rtp_parameters)
                .await?;

            super::dispatcher::broadcast_to_meeting(
                &state.ws_storage,
                &conn.meeting_id,
                ServerPush::NewProducer {
                    participant_id: conn.participant_id.clone(),
                    producer_id: descriptor.id.clone(),
                    kind,
                },
                Some(&conn.connection_id),
            )
            .await;

            auto_consume_for_existing_participants(state, conn, &handle, descriptor.id.clone(), kind).await;

            Ok(serde_json::to_value(descriptor).unwrap_or_default())
        }

        ClientMessage::Consume {
            producer_id,
            rtp_capabilities,
        } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            let descriptor = handle
                .consume(conn.participant_id.clone(), producer_id, rtp_capabilities)
                .await?;
            Ok(serde_json::to_value(descriptor).unwrap_or_default())
        }

        ClientMessage::PauseProducer { producer_id } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle.pause_producer(producer_id).await?;
            Ok(serde_json::Value::Null)
        }
        ClientMessage::ResumeProducer { producer_id } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle.resume_producer(producer_id).await?;
            Ok(serde_json::Value::Null)
        }
        ClientMessage::PauseConsumer { consumer_id } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle.pause_consumer(consumer_id).await?;
            Ok(serde_json::Value::Null)
        }
        ClientMessage::ResumeConsumer { consumer_id } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle.resume_consumer(consumer_id).await?;
            Ok(serde_json::Value::Null)
        }
        ClientMessage::SetPreferredLayers { consumer_id, layers } => {
            require_joined(conn)?;
            let handle = state.meetings.get(&conn.meeting_id)?;
            handle.set_preferred_layers(consumer_id, layers).await?;
            Ok(serde_json::Value::Null)
        }
        ClientMessage::SetPriority { .. } => {
            require_joined(conn)?;
            // Consumer priority only influences bandwidth allocation among a
            // participant's own consumers; nothing in the meeting actor's
            // state needs to change for it, so this is acknowledged as a
            // no-op at the coordination layer.
            Ok(serde_json::Value::Null)
        }
        ClientMessage::RestartIce { transport_id } => {
            require_joined(conn)?;
            let _ = transport_id;
            Err(GatewayError::BadRequest(
                "restartIce is not supported on this deployment".into(),
            ))
        }
        ClientMessage::GetStats => {
            require_joined(conn)?;
            Ok(serde_json::json!({}))
        }

        ClientMessage::Heartbeat => Ok(serde_json::Value::Null),
    }
}

fn require_joined(conn: &ConnState) -> Result<(), GatewayError> {
    if conn.joined {
        Ok(())
    } else {
        Err(GatewayError::BadRequest("connection is not bound to a meeting yet".into()))
    }
}

async fn finish_leave(state: &AppState, conn: &mut ConnState) {
    if let Some(fanout) = conn.fanout.take() {
        fanout.abort();
    }
    state.ws_storage.unbind(&conn.connection_id);
    conn.joined = false;
    let _ = state.meetings.refresh_snapshot(&conn.meeting_id).await;
    super::dispatcher::broadcast_to_meeting(
        &state.ws_storage,
        &conn.meeting_id,
        ServerPush::PeerLeft {
            participant_id: conn.participant_id.clone(),
        },
        Some(&conn.connection_id),
    )
    .await;
}

async fn relay(
    state: &AppState,
    conn: &ConnState,
    to_peer_id: ParticipantId,
    push: impl FnOnce(ParticipantId) -> ServerPush,
) -> Result<serde_json::Value, GatewayError> {
    require_joined(conn)?;
    let handle = state.meetings.get(&conn.meeting_id)?;
    let snapshot = handle.snapshot().await?;
    let members = snapshot.participant_ids.into_iter().collect();
    P2pCoordinator::validate_relay(&members, &conn.participant_id, &to_peer_id)?;

    if let Some(target) = state.ws_storage.connection_for_participant(&to_peer_id) {
        super::dispatcher::send_push(&state.ws_storage, &target, push(conn.participant_id.clone())).await;
    }
    Ok(serde_json::Value::Null)
}

/// Wires consumers for a freshly produced track on the producer side of
/// §4.3's auto-consume contract: every other participant who has already
/// registered RTP capabilities gets a consumer for it without asking.
/// Participants with no capabilities yet, or whose `consume` call fails
/// (no recv transport, incompatible capabilities), are skipped silently —
/// they'll pick the producer up via `catch_up_consumers` once they do
/// register capabilities.
async fn auto_consume_for_existing_participants(
    state: &AppState,
    conn: &ConnState,
    handle: &MeetingHandle,
    producer_id: ProducerId,
    kind: ProducerKind,
) {
    let Ok(snapshot) = handle.snapshot().await else {
        return;
    };

    for participant_id in snapshot.participant_ids {
        if participant_id == conn.participant_id {
            continue;
        }

        let Some(rtp_capabilities) = handle.rtp_capabilities_of(participant_id.clone()).await else {
            continue;
        };

        match handle
            .consume(participant_id.clone(), producer_id.clone(), rtp_capabilities)
            .await
        {
            Ok(descriptor) => {
                if let Some(target) = state.ws_storage.connection_for_participant(&participant_id) {
                    super::dispatcher::send_push(
                        &state.ws_storage,
                        &target,
                        ServerPush::NewConsumer {
                            consumer_id: descriptor.id,
                            producer_id: descriptor.producer_id,
                            kind,
                            rtp_parameters: descriptor.rtp_parameters,
                        },
                    )
                    .await;
                }
            }
            Err(e) => {
                debug!(%participant_id, %e, "skipping auto-consume for new producer");
            }
        }
    }
}

/// The other side of §4.3's auto-consume contract: once a participant
/// registers RTP capabilities, they get consumers for every producer
/// already in the meeting instead of waiting for each one to be
/// re-produced.
async fn catch_up_consumers(
    state: &AppState,
    conn: &ConnState,
    handle: &MeetingHandle,
    rtp_capabilities: serde_json::Value,
) {
    let producers = handle.list_other_producers(conn.participant_id.clone()).await;

    for (_owner, producer_id, kind) in producers {
        match handle
            .consume(conn.participant_id.clone(), producer_id, rtp_capabilities.clone())
            .await
        {
            Ok(descriptor) => {
                super::dispatcher::send_push(
                    &state.ws_storage,
                    &conn.connection_id,
                    ServerPush::NewConsumer {
                        consumer_id: descriptor.id,
                        producer_id: descriptor.producer_id,
                        kind,
                        rtp_parameters: descriptor.rtp_parameters,
                    },
                )
                .await;
            }
            Err(e) => {
                debug!(participant_id = %conn.participant_id, %e, "skipping catch-up consume");
            }
        }
    }
}

fn spawn_fanout(
    state: AppState,
    handle: conflux_core::actor::MeetingHandle,
    conn: &ConnState,
) -> tokio::task::JoinHandle<()> {
    let connection_id = conn.connection_id.clone();
    let self_participant_id = conn.participant_id.clone();
    let mut subs = handle.events.subscribe_all();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(event) = subs.membership.recv() => {
                    if let Some(push) = membership_push(event, &self_participant_id) {
                        super::dispatcher::send_push(&state.ws_storage, &connection_id, push).await;
                    }
                }
                Ok(event) = subs.transitions.recv() => {
                    super::dispatcher::send_push(&state.ws_storage, &connection_id, transition_push(event)).await;
                }
                Ok(event) = subs.active_speaker.recv() => {
                    let ActiveSpeakerEvent { speakers } = event;
                    super::dispatcher::send_push(
                        &state.ws_storage,
                        &connection_id,
                        ServerPush::ActiveSpeakers { participant_ids: speakers },
                    )
                    .await;
                }
                Ok(_event) = subs.stats.recv() => {
                    // Stats pushes are non-essential per §5's backpressure
                    // policy; skip wiring them to a dedicated push type
                    // until a client surface asks for it.
                }
                else => break,
            }
        }
    })
}

fn membership_push(event: MembershipEvent, self_id: &ParticipantId) -> Option<ServerPush> {
    match event {
        MembershipEvent::ParticipantJoined { participant_id, display_name } if participant_id != *self_id => {
            Some(ServerPush::PeerJoined { participant_id, display_name })
        }
        MembershipEvent::ParticipantLeft { participant_id } if participant_id != *self_id => {
            Some(ServerPush::PeerLeft { participant_id })
        }
        MembershipEvent::MediaStateChanged { participant_id, state } if participant_id != *self_id => {
            Some(ServerPush::MediaStateChanged { participant_id, state })
        }
        _ => None,
    }
}

fn transition_push(event: TransitionEvent) -> ServerPush {
    match event {
        TransitionEvent::Started { from, to, deadline_ms, .. } => {
            ServerPush::TransitionStarted { from, to, deadline_ms }
        }
        TransitionEvent::ParticipantAcked { .. } => ServerPush::TransitionInfo {
            acked_count: 0,
            total: 0,
        },
        TransitionEvent::Completed { mode } => ServerPush::TransitionCompleted { mode },
        TransitionEvent::Aborted { reason } => ServerPush::TransitionFailed { reason },
    }
}
