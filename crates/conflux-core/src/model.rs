use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConsumerId, MeetingId, ParticipantId, ProducerId, TransportId};

/// How many samples the per-participant quality window retains (§3: "bounded,
/// most recent N≈10").
pub const QUALITY_WINDOW_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyModeTag {
    Mesh,
    Sfu,
    Transitioning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingOptions {
    pub max_participants: u32,
    pub encryption: bool,
    #[serde(default)]
    pub feature_toggles: Vec<String>,
}

impl Default for MeetingOptions {
    fn default() -> Self {
        Self {
            max_participants: 16,
            encryption: false,
            feature_toggles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaState {
    pub audio: bool,
    pub video: bool,
    pub screen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerKind {
    Audio,
    Video,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Camera,
    Screen,
    Chat,
    Other,
}

/// One simulcast spatial layer, ordered weakly by `max_bitrate_bps`
/// (global invariant §3.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulcastEncoding {
    pub max_bitrate_bps: u32,
    pub scale_down_by: f32,
    pub max_framerate: Option<u32>,
}

/// Server-filled simulcast defaults for §4.3's table, keyed by source.
pub fn default_encodings(source: SourceTag) -> Vec<SimulcastEncoding> {
    match source {
        SourceTag::Screen => vec![SimulcastEncoding {
            max_bitrate_bps: 1_500_000,
            scale_down_by: 1.0,
            max_framerate: Some(30),
        }],
        _ => vec![
            SimulcastEncoding {
                max_bitrate_bps: 100_000,
                scale_down_by: 4.0,
                max_framerate: None,
            },
            SimulcastEncoding {
                max_bitrate_bps: 300_000,
                scale_down_by: 2.0,
                max_framerate: None,
            },
            SimulcastEncoding {
                max_bitrate_bps: 900_000,
                scale_down_by: 1.0,
                max_framerate: None,
            },
        ],
    }
}

#[derive(Debug, Clone)]
pub struct Producer {
    pub id: ProducerId,
    pub owner: ParticipantId,
    pub kind: ProducerKind,
    pub source: SourceTag,
    pub encodings: Vec<SimulcastEncoding>,
    pub paused: bool,
    pub live_score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredLayers {
    pub spatial: u8,
    pub temporal: u8,
}

/// Consumers start at mid-simulcast per §4.3: "spatial 1, temporal 2".
impl Default for PreferredLayers {
    fn default() -> Self {
        Self {
            spatial: 1,
            temporal: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: ConsumerId,
    pub owner: ParticipantId,
    pub producer_id: ProducerId,
    pub kind: ProducerKind,
    pub preferred_layers: PreferredLayers,
    pub paused: bool,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualitySample {
    pub bitrate_bps: u32,
    pub packet_loss_pct: f32,
    pub jitter_ms: u32,
    pub rtt_ms: u32,
    pub timestamp: DateTime<Utc>,
}

/// Bounded sliding window of the most recent `QUALITY_WINDOW_LEN` samples
/// for one participant.
#[derive(Debug, Clone, Default)]
pub struct QualityWindow {
    samples: VecDeque<QualitySample>,
}

impl QualityWindow {
    pub fn push(&mut self, sample: QualitySample) {
        if self.samples.len() == QUALITY_WINDOW_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn samples(&self) -> impl Iterator<Item = &QualitySample> {
        self.samples.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&QualitySample> {
        self.samples.back()
    }

    /// True for each of the last `n` windows whose average packet loss and
    /// RTT both exceed the poor-quality thresholds (§4.2 upward trigger
    /// requires "two consecutive quality windows").
    pub fn last_n_poor(&self, n: usize, loss_threshold_pct: f32, rtt_threshold_ms: u32) -> bool {
        if self.samples.len() < n || n == 0 {
            return false;
        }
        self.samples
            .iter()
            .rev()
            .take(n)
            .all(|s| s.packet_loss_pct > loss_threshold_pct && s.rtt_ms > rtt_threshold_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transports {
    pub send: Option<TransportId>,
    pub recv: Option<TransportId>,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub host: bool,
    pub media_state: MediaState,
    /// Populated on first SFU interaction (`setRtpCapabilities`); `None`
    /// until then per Open Question 3 in §9.
    pub rtp_capabilities: Option<serde_json::Value>,
    pub transports: Transports,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
    pub quality: QualityWindow,
    /// Set while the participant's socket is dead but within ghost-grace
    /// (§4.5); producers/consumers are retained so a reconnect can resume.
    pub suspended: bool,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: Option<String>, host: bool) -> Self {
        Self {
            id,
            display_name,
            joined_at: Utc::now(),
            host,
            media_state: MediaState::default(),
            rtp_capabilities: None,
            transports: Transports::default(),
            producers: Vec::new(),
            consumers: Vec::new(),
            quality: QualityWindow::default(),
            suspended: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Capacity,
    PoorQuality,
    Downgrade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from_mode: TopologyModeTag,
    pub to_mode: TopologyModeTag,
    pub timestamp: DateTime<Utc>,
    pub reason: TransitionReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_share_gets_a_single_high_bitrate_layer() {
        let encodings = default_encodings(SourceTag::Screen);
        assert_eq!(encodings.len(), 1);
        assert_eq!(encodings[0].max_bitrate_bps, 1_500_000);
    }

    #[test]
    fn camera_and_other_get_three_layers_ordered_by_bitrate() {
        for source in [SourceTag::Camera, SourceTag::Other] {
            let encodings = default_encodings(source);
            assert_eq!(encodings.len(), 3);
            assert!(encodings.windows(2).all(|w| w[0].max_bitrate_bps < w[1].max_bitrate_bps));
        }
    }

    fn sample(loss: f32, rtt: u32) -> QualitySample {
        QualitySample {
            bitrate_bps: 100_000,
            packet_loss_pct: loss,
            jitter_ms: 5,
            rtt_ms: rtt,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn last_n_poor_requires_every_one_of_the_last_n_windows_to_be_poor() {
        let mut window = QualityWindow::default();
        window.push(sample(10.0, 300));
        window.push(sample(1.0, 20));

        // Most recent sample is healthy, so the last 2 are not poor even
        // though an older one was.
        assert!(!window.last_n_poor(2, 5.0, 200));

        window.push(sample(10.0, 300));
        assert!(window.last_n_poor(2, 5.0, 200));
    }

    #[test]
    fn quality_window_is_bounded_to_its_configured_length() {
        let mut window = QualityWindow::default();
        for i in 0..(QUALITY_WINDOW_LEN as u32 + 5) {
            window.push(sample(0.0, i));
        }
        let count = window.samples().count();
        assert_eq!(count, QUALITY_WINDOW_LEN);
        assert_eq!(window.latest().unwrap().rtt_ms, QUALITY_WINDOW_LEN as u32 + 4);
    }
}

#[derive(Debug, Clone)]
pub struct MeetingSnapshot {
    pub id: MeetingId,
    pub created_at: DateTime<Utc>,
    pub host_id: ParticipantId,
    pub options: MeetingOptions,
    pub mode: TopologyModeTag,
    pub participant_ids: Vec<ParticipantId>,
    pub transition_history: Vec<TransitionRecord>,
    pub last_transition_time: Option<DateTime<Utc>>,
}
