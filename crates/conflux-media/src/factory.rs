use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use conflux_core::error::RouterError;
use conflux_core::ids::MeetingId;
use conflux_core::media_backend::{MediaBackendFactory, MediaRouter};

use crate::router::MediasoupRouter;
use crate::worker_pool::WorkerPool;

/// `conflux-core`'s `MediaBackendFactory` implemented over a real
/// `WorkerPool`: selects the next worker round-robin and builds a router
/// for it, the same split of responsibility as the reference stack's
/// `RoomManager::create_room` calling into `WorkerPool::get_worker`.
pub struct MediasoupBackendFactory {
    worker_pool: Arc<WorkerPool>,
    listen_ip: IpAddr,
    announced_ip: Option<String>,
}

impl MediasoupBackendFactory {
    pub fn new(worker_pool: Arc<WorkerPool>, listen_ip: IpAddr, announced_ip: Option<String>) -> Self {
        Self {
            worker_pool,
            listen_ip,
            announced_ip,
        }
    }
}

#[async_trait]
impl MediaBackendFactory for MediasoupBackendFactory {
    async fn create_router(&self, meeting_id: &MeetingId) -> Result<Box<dyn MediaRouter>, RouterError> {
        let worker = self.worker_pool.get_worker().await?;
        let router = MediasoupRouter::create(&worker, self.listen_ip, self.announced_ip.clone()).await?;
        info!(%meeting_id, "sfu router created");
        Ok(Box::new(router) as Box<dyn MediaRouter>)
    }
}
