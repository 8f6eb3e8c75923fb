use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

use crate::state::AppState;

fn started_at() -> &'static Instant {
    static STARTED_AT: OnceLock<Instant> = OnceLock::new();
    STARTED_AT.get_or_init(Instant::now)
}

/// Call once at process startup so `uptime_secs` is measured from process
/// start rather than from the first `/health` request.
pub fn mark_started() {
    started_at();
}

#[derive(Debug, Serialize)]
pub struct HealthStats {
    pub active_meetings: usize,
    pub live_connections: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub stats: HealthStats,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: started_at().elapsed().as_secs(),
        stats: HealthStats {
            active_meetings: state.meetings.len(),
            live_connections: state.ws_storage.connection_count(),
        },
    })
}
