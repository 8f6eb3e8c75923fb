use std::sync::Arc;
use std::time::Duration;

use conflux_core::events::{MeetingEventBus, StatsEvent};
use conflux_core::ids::{ConsumerId, ParticipantId, ProducerId};
use conflux_core::media_backend::MediaRouter;
use tracing::warn;

/// One outstanding producer/consumer this collector polls each tick. The
/// meeting actor registers/unregisters entries as producers and consumers
/// come and go; this module only knows how to poll whatever it's handed.
#[derive(Debug, Clone)]
pub enum TrackedEntity {
    Producer {
        producer_id: ProducerId,
        owner: ParticipantId,
    },
    Consumer {
        consumer_id: ConsumerId,
        owner: ParticipantId,
    },
}

/// Polls `router_stats` for every tracked entity on a fixed interval and
/// republishes results on the meeting's `StatsEvent` channel (§4.3 "periodic
/// stats collection, 5s interval" generalized from the HTE's own
/// quality-check cadence).
pub async fn run_stats_collector(
    router: Arc<dyn MediaRouter>,
    events: Arc<MeetingEventBus>,
    entities: Arc<tokio::sync::RwLock<Vec<TrackedEntity>>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshot = entities.read().await.clone();
        for entity in snapshot {
            match entity {
                TrackedEntity::Producer { producer_id, owner } => {
                    match router.producer_stats(&producer_id).await {
                        Ok((bitrate_bps, packet_loss_pct)) => {
                            let _ = events.stats.send(StatsEvent::Producer {
                                producer_id,
                                owner,
                                bitrate_bps,
                                packet_loss_pct,
                            });
                        }
                        Err(err) => warn!(%err, "failed to poll producer stats"),
                    }
                }
                TrackedEntity::Consumer { consumer_id, owner } => {
                    match router.consumer_stats(&consumer_id).await {
                        Ok((bitrate_bps, packet_loss_pct, rtt_ms)) => {
                            let _ = events.stats.send(StatsEvent::Consumer {
                                consumer_id,
                                owner,
                                bitrate_bps,
                                packet_loss_pct,
                                rtt_ms,
                            });
                        }
                        Err(err) => warn!(%err, "failed to poll consumer stats"),
                    }
                }
            }
        }
    }
}
