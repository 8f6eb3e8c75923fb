use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mediasoup::worker::{Worker, WorkerId, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use conflux_config::MediasoupSettings;
use conflux_core::error::RouterError;

/// Above this cpu%, a worker is considered overloaded for scoring purposes.
const CPU_OVERLOAD_PCT: f64 = 80.0;
/// Weight given to a worker's live router count in the selection score.
const ROUTER_COUNT_WEIGHT: f64 = 5.0;
/// How long to wait before spawning a dead worker's replacement.
const REPLACEMENT_DELAY: Duration = Duration::from_secs(2);
const DEATH_BROADCAST_CAPACITY: usize = 32;

struct WorkerSlot {
    worker: Worker,
    created_at: Instant,
}

/// Pool of mediasoup worker processes, one per `mediasoup.num_workers`
/// configured. Workers are scored by `cpu% + 5 × router_count` (§4.7) and
/// the lowest-scoring worker is handed out, falling back to round robin
/// once every worker is over 80% cpu. A worker's death spawns a
/// replacement and broadcasts the dead worker's id so meetings running on
/// it can reallocate their router.
pub struct WorkerPool {
    worker_manager: WorkerManager,
    settings: MediasoupSettings,
    slots: RwLock<Vec<WorkerSlot>>,
    next: AtomicUsize,
    deaths: broadcast::Sender<WorkerId>,
}

impl WorkerPool {
    pub async fn new(settings: &MediasoupSettings) -> Result<Arc<Self>, RouterError> {
        let (deaths, _) = broadcast::channel(DEATH_BROADCAST_CAPACITY);

        let pool = Arc::new(Self {
            worker_manager: WorkerManager::new(),
            settings: settings.clone(),
            slots: RwLock::new(Vec::with_capacity(settings.num_workers as usize)),
            next: AtomicUsize::new(0),
            deaths,
        });

        for i in 0..settings.num_workers {
            let worker = pool.spawn_worker().await?;
            info!(worker_id = %worker.id(), index = i, "mediasoup worker created");
            pool.slots.write().await.push(WorkerSlot {
                worker,
                created_at: Instant::now(),
            });
        }

        if pool.slots.read().await.is_empty() {
            return Err(RouterError::NoWorkersAvailable);
        }

        Ok(pool)
    }

    /// Creates one worker and wires its death callback to remove it from
    /// the pool, broadcast its id, and spawn a replacement within
    /// [`REPLACEMENT_DELAY`].
    async fn spawn_worker(self: &Arc<Self>) -> Result<Worker, RouterError> {
        let mut worker_settings = WorkerSettings::default();
        worker_settings.rtc_port_range = self.settings.rtc_min_port..=self.settings.rtc_max_port;

        let worker = self
            .worker_manager
            .create_worker(worker_settings)
            .await
            .map_err(|e| RouterError::RouterCreationFailed(e.to_string()))?;

        let worker_id = worker.id();
        let pool = Arc::clone(self);
        worker
            .on_dead(move |reason| {
                error!(?reason, %worker_id, "mediasoup worker died");
                let _ = pool.deaths.send(worker_id);

                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    pool.slots.write().await.retain(|slot| slot.worker.id() != worker_id);
                    tokio::time::sleep(REPLACEMENT_DELAY).await;
                    match pool.spawn_worker().await {
                        Ok(replacement) => {
                            info!(worker_id = %replacement.id(), "replacement mediasoup worker spawned");
                            pool.slots.write().await.push(WorkerSlot {
                                worker: replacement,
                                created_at: Instant::now(),
                            });
                        }
                        Err(e) => error!(%e, "failed to spawn replacement mediasoup worker"),
                    }
                });
            })
            .detach();

        Ok(worker)
    }

    /// Lowest `cpu% + 5 × router_count` wins; round robin once every
    /// worker is over 80% cpu.
    pub async fn get_worker(&self) -> Result<Worker, RouterError> {
        let slots = self.slots.read().await;
        if slots.is_empty() {
            return Err(RouterError::NoWorkersAvailable);
        }

        let mut scored = Vec::with_capacity(slots.len());
        for slot in slots.iter() {
            let cpu_pct = worker_cpu_pct(&slot.worker, slot.created_at).await;
            let router_count = worker_router_count(&slot.worker).await;
            scored.push((cpu_pct, router_count));
        }

        if scored.iter().all(|(cpu, _)| *cpu > CPU_OVERLOAD_PCT) {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % slots.len();
            warn!("all mediasoup workers over cpu threshold; falling back to round robin");
            return Ok(slots[idx].worker.clone());
        }

        let best = scored
            .iter()
            .enumerate()
            .map(|(i, (cpu, routers))| (i, cpu + ROUTER_COUNT_WEIGHT * (*routers as f64)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);

        Ok(slots[best].worker.clone())
    }

    pub async fn worker_count(&self) -> usize {
        self.slots.read().await.len()
    }

    pub fn subscribe_deaths(&self) -> broadcast::Receiver<WorkerId> {
        self.deaths.subscribe()
    }
}

async fn worker_cpu_pct(worker: &Worker, created_at: Instant) -> f64 {
    let usage = match worker.get_resource_usage().await {
        Ok(usage) => usage,
        Err(e) => {
            warn!(%e, worker_id = %worker.id(), "failed to read worker resource usage");
            return 0.0;
        }
    };

    let elapsed_ms = created_at.elapsed().as_millis().max(1) as f64;
    let busy_ms = (usage.ru_utime + usage.ru_stime) as f64;
    (busy_ms / elapsed_ms) * 100.0
}

async fn worker_router_count(worker: &Worker) -> usize {
    match worker.dump().await {
        Ok(dump) => dump.router_ids.len(),
        Err(e) => {
            warn!(%e, worker_id = %worker.id(), "failed to read worker dump");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_prefers_lower_combined_load() {
        let lightly_loaded = 10.0 + ROUTER_COUNT_WEIGHT * 1.0;
        let heavily_loaded = 5.0 + ROUTER_COUNT_WEIGHT * 4.0;
        assert!(lightly_loaded < heavily_loaded);
    }
}
