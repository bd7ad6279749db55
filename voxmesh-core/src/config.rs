use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub mesh: MeshConfig,
    pub presence: PresenceConfig,
    pub relay: RelayConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Peer mesh and session coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN/TURN URLs handed to the WebRTC transport
    pub ice_servers: Vec<String>,
    /// Pause after tearing down a session of the other kind (call vs channel)
    /// before joining, so capture devices are released
    pub session_settle_delay_ms: u64,
    /// Periodic membership reconciliation while a session is active
    pub reconcile_interval_secs: u64,
    /// Upper bound for a single negotiation step on a link
    pub negotiation_timeout_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            session_settle_delay_ms: 300,
            reconcile_interval_secs: 15,
            negotiation_timeout_secs: 10,
        }
    }
}

impl MeshConfig {
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.session_settle_delay_ms)
    }

    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

/// Presence tracker settings. The grace period and the inactivity timeouts are
/// product choices, not protocol constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_secs: u64,
    /// Re-announcement interval countering server-side staleness eviction
    pub keepalive_interval_secs: u64,
    /// Local input inactivity before reporting `away`
    pub away_timeout_secs: u64,
    /// Local input inactivity before reporting `idle`
    pub idle_timeout_secs: u64,
    /// Tolerated relay outage before active sessions are force-left
    pub grace_period_secs: u64,
    /// Remote records not refreshed within this window read as offline
    pub stale_after_secs: u64,
    pub activity_check_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            keepalive_interval_secs: 240,
            away_timeout_secs: 300,
            idle_timeout_secs: 1800,
            grace_period_secs: 300,
            stale_after_secs: 120,
            activity_check_interval_secs: 15,
        }
    }
}

impl PresenceConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    #[must_use]
    pub const fn away_timeout(&self) -> Duration {
        Duration::from_secs(self.away_timeout_secs)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    #[must_use]
    pub const fn activity_check_interval(&self) -> Duration {
        Duration::from_secs(self.activity_check_interval_secs)
    }
}

/// Signal relay client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub send_timeout_secs: u64,
    pub max_send_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long a delivered signal id is remembered for dedup
    pub dedup_window_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 5,
            max_send_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            dedup_window_secs: 60,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    #[must_use]
    pub const fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Local capture preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Start the voice track with noise suppression enabled
    pub noise_suppression: bool,
    pub audio_input_device: Option<String>,
    pub video_input_device: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            noise_suppression: true,
            audio_input_device: None,
            video_input_device: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // VOXMESH_PRESENCE__GRACE_PERIOD_SECS=60 and the like; the double
        // separator keeps snake_case field names intact
        builder = builder.add_source(
            Environment::with_prefix("VOXMESH")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("mesh.ice_servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check cross-field constraints, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let p = &self.presence;

        if p.heartbeat_interval_secs == 0 {
            errors.push("presence.heartbeat_interval_secs must be greater than 0".to_string());
        }
        if p.keepalive_interval_secs < p.heartbeat_interval_secs {
            errors.push(
                "presence.keepalive_interval_secs must not be shorter than the heartbeat interval"
                    .to_string(),
            );
        }
        if p.idle_timeout_secs < p.away_timeout_secs {
            errors.push("presence.idle_timeout_secs must not be shorter than away_timeout_secs".to_string());
        }
        if p.grace_period_secs == 0 {
            errors.push("presence.grace_period_secs must be greater than 0".to_string());
        }
        if p.activity_check_interval_secs == 0 {
            errors.push("presence.activity_check_interval_secs must be greater than 0".to_string());
        }
        if self.mesh.reconcile_interval_secs == 0 {
            errors.push("mesh.reconcile_interval_secs must be greater than 0".to_string());
        }
        if self.relay.max_send_attempts == 0 {
            errors.push("relay.max_send_attempts must be at least 1".to_string());
        }
        if self.relay.initial_backoff_ms > self.relay.max_backoff_ms {
            errors.push("relay.initial_backoff_ms must not exceed relay.max_backoff_ms".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
