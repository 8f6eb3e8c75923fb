use conflux_config::Settings;
use conflux_gateway::routes::health::mark_started;
use conflux_gateway::{build_router, state::AppState};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "conflux_gateway=debug,conflux_core=debug,conflux_media=debug,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    mark_started();

    let settings = Settings::load()?;
    info!(
        host = %settings.app.host,
        port = settings.app.port,
        "starting conflux gateway"
    );

    let app_state = AppState::new(settings.clone()).await?;
    let app = build_router(app_state);

    let addr = format!("{}:{}", settings.app.host, settings.app.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
