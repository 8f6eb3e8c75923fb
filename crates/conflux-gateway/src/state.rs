use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;

use conflux_config::Settings;
use conflux_core::manager::MeetingManager;
use conflux_core::media_backend::MediaBackendFactory;
use conflux_core::registry::RoomRegistry;
use conflux_media::{MediasoupBackendFactory, WorkerPool};
use conflux_registry::RedisRoomRegistry;

use crate::auth::AuthClient;
use crate::ws::storage::WsStorage;

/// Everything a request/WS handler needs, composed once at startup the way
/// the reference stack's `AppState::new` wires `RoomManager`, `AuthService`
/// and DAOs together.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub auth: AuthClient,
    pub meetings: Arc<MeetingManager>,
    pub ws_storage: Arc<WsStorage>,
}

impl AppState {
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let worker_pool = WorkerPool::new(&settings.mediasoup).await?;
        let mut worker_deaths = worker_pool.subscribe_deaths();

        let listen_ip: IpAddr = settings
            .mediasoup
            .listen_ip
            .parse()
            .unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
        let announced_ip = if settings.mediasoup.announced_ip.is_empty() {
            None
        } else {
            Some(settings.mediasoup.announced_ip.clone())
        };

        let media_factory: Arc<dyn MediaBackendFactory> = Arc::new(MediasoupBackendFactory::new(
            worker_pool,
            listen_ip,
            announced_ip,
        ));

        let registry: Arc<dyn RoomRegistry> =
            Arc::new(RedisRoomRegistry::connect(&settings.redis).await?);

        let meetings = Arc::new(MeetingManager::new(
            media_factory,
            registry,
            settings.topology.clone(),
        ));

        let meetings_for_deaths = meetings.clone();
        tokio::spawn(async move {
            while let Ok(worker_id) = worker_deaths.recv().await {
                warn!(%worker_id, "reallocating meeting routers after worker loss");
                meetings_for_deaths.reconcile_all_routers(worker_id.to_string()).await;
            }
        });

        let auth = AuthClient::new(&settings.auth);
        let ws_storage = Arc::new(WsStorage::new());

        Ok(Self {
            settings,
            auth,
            meetings,
            ws_storage,
        })
    }
}
