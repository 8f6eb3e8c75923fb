pub mod auth;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let room_routes = Router::new()
        .route("/", post(routes::rooms::create))
        .route("/", get(routes::rooms::list))
        .route("/{room_id}", get(routes::rooms::get))
        .route("/{room_id}", delete(routes::rooms::delete));

    Router::new()
        .route("/health", get(routes::health::health))
        .nest("/rooms", room_routes)
        .route("/ws", get(ws::handler::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
