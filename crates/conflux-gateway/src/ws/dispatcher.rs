use axum::extract::ws::Message;
use futures::SinkExt;
use tracing::warn;

use conflux_core::ids::ConnectionId;

use super::protocol::{OutgoingPush, ServerPush};
use super::storage::WsStorage;

/// Pushes a server-originated message to one connection. Per §5's
/// backpressure policy, a send failure here only drops that one push —
/// the caller decides whether the dropped push was essential (membership,
/// transitions) or not (stats, active-speaker).
pub async fn send_push(ws_storage: &WsStorage, connection_id: &ConnectionId, push: ServerPush) {
    let Some(sender) = ws_storage.get(connection_id) else {
        return;
    };

    let text = serde_json::to_string(&OutgoingPush { push }).unwrap_or_default();
    let mut guard = sender.lock().await;
    if let Err(e) = guard.send(Message::text(text)).await {
        warn!(%connection_id, %e, "failed to send WS push");
    }
}

pub async fn broadcast(ws_storage: &WsStorage, connection_ids: &[ConnectionId], push: ServerPush) {
    for connection_id in connection_ids {
        send_push(ws_storage, connection_id, push.clone()).await;
    }
}

/// Pushes to every connection bound to a meeting, skipping `exclude` (the
/// connection that originated the change, which already knows about its
/// own action via the request reply).
pub async fn broadcast_to_meeting(
    ws_storage: &WsStorage,
    meeting_id: &conflux_core::ids::MeetingId,
    push: ServerPush,
    exclude: Option<&ConnectionId>,
) {
    for connection_id in ws_storage.connections_in_meeting(meeting_id) {
        if Some(&connection_id) == exclude {
            continue;
        }
        send_push(ws_storage, &connection_id, push.clone()).await;
    }
}
