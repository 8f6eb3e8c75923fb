use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub mediasoup: MediasoupSettings,
    pub redis: RedisSettings,
    pub auth: AuthSettings,
    pub turn: TurnSettings,
    pub topology: TopologySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediasoupSettings {
    pub num_workers: u32,
    pub listen_ip: String,
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisSettings {
    pub url: String,
}

/// Settings for the external auth-service collaborator (§6). The core never
/// issues or stores credentials itself — it only calls out to verify a
/// bearer token and trusts the `identity` the service returns.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub verify_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TurnSettings {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub force_relay: bool,
}

/// The numeric knobs enumerated in spec §6 "Configuration". Kept as one
/// struct so the Hybrid Topology Engine and the gateway's heartbeat/ghost-grace
/// logic read from a single settings value rather than scattered constants.
#[derive(Debug, Deserialize, Clone)]
pub struct TopologySettings {
    pub p2p_threshold: u32,
    pub sfu_threshold: u32,
    pub transition_timeout_ms: u64,
    pub min_time_between_transitions_ms: u64,
    pub quality_check_interval_ms: u64,
    pub poor_quality_packet_loss_pct: f32,
    pub poor_quality_rtt_ms: u32,
    pub ghost_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub prewarm_idle_timeout_ms: u64,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .prefix("CONFLUX"),
            )
            .set_default("app.host", "0.0.0.0")?
            .set_default("app.port", 3000)?
            .set_default("app.cors_origins", Vec::<String>::new())?
            .set_default("mediasoup.num_workers", 2)?
            .set_default("mediasoup.listen_ip", "0.0.0.0")?
            .set_default("mediasoup.announced_ip", "127.0.0.1")?
            .set_default("mediasoup.rtc_min_port", 40000)?
            .set_default("mediasoup.rtc_max_port", 49999)?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("auth.verify_url", "http://localhost:4000/verify")?
            .set_default("auth.timeout_ms", 2000)?
            .set_default("turn.url", None::<String>)?
            .set_default("turn.username", None::<String>)?
            .set_default("turn.password", None::<String>)?
            .set_default("turn.force_relay", false)?
            .set_default("topology.p2p_threshold", 3)?
            .set_default("topology.sfu_threshold", 4)?
            .set_default("topology.transition_timeout_ms", 2000)?
            .set_default("topology.min_time_between_transitions_ms", 10000)?
            .set_default("topology.quality_check_interval_ms", 5000)?
            .set_default("topology.poor_quality_packet_loss_pct", 5.0)?
            .set_default("topology.poor_quality_rtt_ms", 200)?
            .set_default("topology.ghost_grace_ms", 15000)?
            .set_default("topology.heartbeat_interval_ms", 30000)?
            .set_default("topology.prewarm_idle_timeout_ms", 60000)?
            .build()?;

        config.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::load().expect("failed to load default settings")
    }
}
