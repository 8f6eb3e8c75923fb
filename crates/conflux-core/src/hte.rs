use chrono::{DateTime, Utc};
use conflux_config::TopologySettings;

use crate::model::{QualityWindow, TransitionReason};

/// Pure decision logic for the Hybrid Topology Engine's mode-switch policy
/// (§4.2), separated from the actor/IO so the hysteresis gates can be unit
/// tested directly against participant counts and quality samples.
pub struct HysteresisPolicy<'a> {
    settings: &'a TopologySettings,
}

impl<'a> HysteresisPolicy<'a> {
    pub fn new(settings: &'a TopologySettings) -> Self {
        Self { settings }
    }

    fn within_min_dwell(&self, last_transition: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_transition {
            Some(t) => {
                let elapsed = (now - t).num_milliseconds().max(0) as u64;
                elapsed < self.settings.min_time_between_transitions_ms
            }
            None => false,
        }
    }

    /// Upward trigger: participant count at/above `sfu_threshold`, OR two
    /// consecutive poor-quality windows for any participant while already
    /// above `p2p_threshold`. Blocked during the minimum dwell period.
    pub fn should_upgrade(
        &self,
        participant_count: u32,
        quality_windows: &[&QualityWindow],
        last_transition: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<TransitionReason> {
        if self.within_min_dwell(last_transition, now) {
            return None;
        }

        if participant_count >= self.settings.sfu_threshold {
            return Some(TransitionReason::Capacity);
        }

        if participant_count > self.settings.p2p_threshold {
            let poor = quality_windows.iter().any(|w| {
                w.last_n_poor(
                    2,
                    self.settings.poor_quality_packet_loss_pct,
                    self.settings.poor_quality_rtt_ms,
                )
            });
            if poor {
                return Some(TransitionReason::PoorQuality);
            }
        }

        None
    }

    /// Downward trigger: participant count at/below `p2p_threshold`, no
    /// transition within the dwell period, AND quality is not currently
    /// poor for anyone — downgrading a struggling meeting back to mesh
    /// would only make its quality worse.
    pub fn should_downgrade(
        &self,
        participant_count: u32,
        quality_windows: &[&QualityWindow],
        last_transition: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<TransitionReason> {
        if self.within_min_dwell(last_transition, now) {
            return None;
        }

        if participant_count > self.settings.p2p_threshold {
            return None;
        }

        let poor = quality_windows.iter().any(|w| {
            w.last_n_poor(
                2,
                self.settings.poor_quality_packet_loss_pct,
                self.settings.poor_quality_rtt_ms,
            )
        });
        if poor {
            return None;
        }

        Some(TransitionReason::Downgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QualitySample;

    fn settings() -> TopologySettings {
        TopologySettings {
            p2p_threshold: 3,
            sfu_threshold: 4,
            transition_timeout_ms: 2000,
            min_time_between_transitions_ms: 10_000,
            quality_check_interval_ms: 5000,
            poor_quality_packet_loss_pct: 5.0,
            poor_quality_rtt_ms: 200,
            ghost_grace_ms: 15_000,
            heartbeat_interval_ms: 30_000,
            prewarm_idle_timeout_ms: 60_000,
        }
    }

    #[test]
    fn upgrades_at_capacity_threshold() {
        let s = settings();
        let policy = HysteresisPolicy::new(&s);
        let now = Utc::now();
        assert_eq!(
            policy.should_upgrade(4, &[], None, now),
            Some(TransitionReason::Capacity)
        );
        assert_eq!(policy.should_upgrade(3, &[], None, now), None);
    }

    #[test]
    fn upgrade_blocked_during_min_dwell() {
        let s = settings();
        let policy = HysteresisPolicy::new(&s);
        let now = Utc::now();
        let last = now - chrono::Duration::milliseconds(1000);
        assert_eq!(policy.should_upgrade(5, &[], Some(last), now), None);
    }

    #[test]
    fn upgrade_on_two_consecutive_poor_quality_windows() {
        let s = settings();
        let policy = HysteresisPolicy::new(&s);
        let now = Utc::now();

        let mut window = QualityWindow::default();
        for _ in 0..2 {
            window.push(QualitySample {
                bitrate_bps: 50_000,
                packet_loss_pct: 10.0,
                jitter_ms: 5,
                rtt_ms: 300,
                timestamp: now,
            });
        }

        // Below sfu_threshold but above p2p_threshold with poor quality.
        assert_eq!(
            policy.should_upgrade(4 - 1, &[&window], None, now),
            Some(TransitionReason::PoorQuality)
        );
    }

    #[test]
    fn downgrades_at_or_below_p2p_threshold() {
        let s = settings();
        let policy = HysteresisPolicy::new(&s);
        let now = Utc::now();
        assert_eq!(
            policy.should_downgrade(3, &[], None, now),
            Some(TransitionReason::Downgrade)
        );
        assert_eq!(policy.should_downgrade(4, &[], None, now), None);
    }

    #[test]
    fn downgrade_blocked_during_min_dwell() {
        let s = settings();
        let policy = HysteresisPolicy::new(&s);
        let now = Utc::now();
        let last = now - chrono::Duration::milliseconds(500);
        assert_eq!(policy.should_downgrade(1, &[], Some(last), now), None);
    }

    #[test]
    fn downgrade_blocked_while_quality_is_poor() {
        let s = settings();
        let policy = HysteresisPolicy::new(&s);
        let now = Utc::now();

        let mut window = QualityWindow::default();
        for _ in 0..2 {
            window.push(QualitySample {
                bitrate_bps: 50_000,
                packet_loss_pct: 10.0,
                jitter_ms: 5,
                rtt_ms: 300,
                timestamp: now,
            });
        }

        assert_eq!(policy.should_downgrade(2, &[&window], None, now), None);

        let healthy = QualityWindow::default();
        assert_eq!(
            policy.should_downgrade(2, &[&healthy], None, now),
            Some(TransitionReason::Downgrade)
        );
    }
}
