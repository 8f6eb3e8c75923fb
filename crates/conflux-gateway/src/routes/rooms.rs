use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conflux_core::ids::{MeetingId, ParticipantId};
use conflux_core::model::{MeetingOptions, TopologyModeTag};

use crate::error::GatewayError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub host_peer_id: String,
    pub max_participants: Option<u32>,
    pub encryption: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
    pub join_link: String,
    pub host_peer_id: String,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, GatewayError> {
    let room_id = MeetingId::from(Uuid::new_v4().to_string());
    let host_id = ParticipantId::from(body.host_peer_id.clone());

    let mut options = MeetingOptions::default();
    if let Some(max) = body.max_participants {
        options.max_participants = max;
    }
    if let Some(encryption) = body.encryption {
        options.encryption = encryption;
    }

    state
        .meetings
        .create_meeting(room_id.clone(), host_id, None, options)
        .await?;

    let join_link = format!(
        "{}/ws?meeting_id={}",
        state.settings.app.host, room_id.as_str()
    );

    Ok(Json(CreateRoomResponse {
        room_id: room_id.0,
        join_link,
        host_peer_id: body.host_peer_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub id: String,
    pub host_id: String,
    pub mode: TopologyModeTag,
    pub participant_count: u32,
    pub created_at_epoch_ms: i64,
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RoomResponse>, GatewayError> {
    let meeting_id = MeetingId::from(id);
    let snapshot = state
        .meetings
        .get_snapshot(&meeting_id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("room {meeting_id} not found")))?;

    Ok(Json(RoomResponse {
        id: snapshot.meeting_id.0,
        host_id: snapshot.host_id.0,
        mode: snapshot.mode,
        participant_count: snapshot.participant_count,
        created_at_epoch_ms: snapshot.created_at_epoch_ms,
    }))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode, GatewayError> {
    let meeting_id = MeetingId::from(id);
    state.meetings.end_meeting(&meeting_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<RoomResponse>>, GatewayError> {
    let snapshots = state.meetings.list_snapshots().await?;
    let rooms = snapshots
        .into_iter()
        .map(|s| RoomResponse {
            id: s.meeting_id.0,
            host_id: s.host_id.0,
            mode: s.mode,
            participant_count: s.participant_count,
            created_at_epoch_ms: s.created_at_epoch_ms,
        })
        .collect();
    Ok(Json(rooms))
}
