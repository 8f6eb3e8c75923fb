use std::collections::HashMap;
use std::time::Duration;

use conflux_core::ids::{ParticipantId, ProducerId};

const TOP_K: usize = 3;
const SPEAKING_THRESHOLD_DBFS: i8 = -50;
const SILENCE_FLOOR_DBFS: i8 = -60;
const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(200);
const AGGREGATION_WINDOW: Duration = Duration::from_secs(1);

/// One audio-level sample for a producer, as mediasoup's AudioLevelObserver
/// or ActiveSpeakerObserver events report them (dBFS, where 0 is loudest
/// and negative values attenuate toward silence).
#[derive(Debug, Clone, Copy)]
pub struct AudioLevelSample {
    pub producer_id_hash: u64,
    pub dbfs: i8,
}

/// Aggregates audio-level callbacks over a 1s window and picks the top-k
/// loudest participants above the speaking threshold, rate-limited so the
/// gateway never pushes `activeSpeakerChanged` more than once per 200ms
/// (§4.3). Pure accumulation logic, independent of the mediasoup callback
/// plumbing that feeds it, so it can be unit tested directly.
pub struct ActiveSpeakerAggregator {
    window: HashMap<ParticipantId, Vec<i8>>,
    last_emitted: Option<tokio::time::Instant>,
}

impl ActiveSpeakerAggregator {
    pub fn new() -> Self {
        Self {
            window: HashMap::new(),
            last_emitted: None,
        }
    }

    pub fn record(&mut self, participant_id: ParticipantId, dbfs: i8) {
        if dbfs < SILENCE_FLOOR_DBFS {
            return;
        }
        self.window.entry(participant_id).or_default().push(dbfs);
    }

    /// Call once per aggregation tick. Returns `Some(speakers)` only when
    /// the rate limit allows a new push; always clears the window.
    pub fn tick(&mut self, now: tokio::time::Instant) -> Option<Vec<ParticipantId>> {
        let speakers = self.compute_top_k();
        self.window.clear();

        let allowed = match self.last_emitted {
            Some(last) => now.duration_since(last) >= MIN_UPDATE_INTERVAL,
            None => true,
        };

        if !allowed {
            return None;
        }

        self.last_emitted = Some(now);
        Some(speakers)
    }

    fn compute_top_k(&self) -> Vec<ParticipantId> {
        let mut averages: Vec<(ParticipantId, f32)> = self
            .window
            .iter()
            .filter_map(|(id, samples)| {
                let avg = samples.iter().map(|&d| d as f32).sum::<f32>() / samples.len() as f32;
                if avg as i8 >= SPEAKING_THRESHOLD_DBFS {
                    Some((id.clone(), avg))
                } else {
                    None
                }
            })
            .collect();

        averages.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        averages.into_iter().take(TOP_K).map(|(id, _)| id).collect()
    }
}

impl Default for ActiveSpeakerAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a raw mediasoup producer id back to the participant that owns it,
/// since audio-level observer callbacks only carry a `ProducerId`.
pub fn aggregation_window() -> Duration {
    AGGREGATION_WINDOW
}

#[derive(Debug, Clone)]
pub struct ProducerOwnership {
    pub producer_id: ProducerId,
    pub participant_id: ParticipantId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ParticipantId {
        ParticipantId(s.to_string())
    }

    #[test]
    fn picks_top_k_loudest_above_threshold() {
        let mut agg = ActiveSpeakerAggregator::new();
        agg.record(id("a"), -40);
        agg.record(id("b"), -45);
        agg.record(id("c"), -55); // below threshold
        agg.record(id("d"), -30);

        let now = tokio::time::Instant::now();
        let speakers = agg.tick(now).unwrap();

        assert_eq!(speakers.len(), 3);
        assert_eq!(speakers[0], id("d"));
        assert_eq!(speakers[1], id("a"));
        assert_eq!(speakers[2], id("b"));
    }

    #[test]
    fn silence_floor_drops_sample_entirely() {
        let mut agg = ActiveSpeakerAggregator::new();
        agg.record(id("a"), -70);
        let now = tokio::time::Instant::now();
        let speakers = agg.tick(now).unwrap();
        assert!(speakers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_to_one_update_per_200ms() {
        let mut agg = ActiveSpeakerAggregator::new();
        agg.record(id("a"), -10);

        let t0 = tokio::time::Instant::now();
        assert!(agg.tick(t0).is_some());

        agg.record(id("a"), -10);
        assert!(agg.tick(t0).is_none());

        tokio::time::advance(Duration::from_millis(250)).await;
        agg.record(id("a"), -10);
        assert!(agg.tick(tokio::time::Instant::now()).is_some());
    }
}
