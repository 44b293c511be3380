use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use beerbot_core::{GiftAssociator, QuantityMode};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("failed to write config: {0}")]
    Write(#[source] io::Error),

    #[error("missing {0}; set it in the config file or the environment")]
    MissingCredential(&'static str),

    #[error("slack.channel must name the channel to monitor")]
    MissingChannel,

    #[error("quota.max_per_day must be at least 1")]
    InvalidQuota,

    #[error("gifts.markers must contain at least one non-empty marker")]
    NoMarkers,

    #[error("gifts.markers cannot be compiled: {0}")]
    InvalidMarkers(String),

    #[error("supervisor backoff is invalid: {0}")]
    InvalidBackoff(&'static str),

    #[error("supervisor.max_in_flight must be at least 1")]
    InvalidConcurrency,

    #[error("ledger directory {path} is not accessible: {source}")]
    LedgerPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    /// Bot token (`xoxb-...`). `SLACK_BOT_TOKEN` takes precedence.
    pub bot_token: String,
    /// App-level token (`xapp-...`) used to open Socket Mode connections.
    /// `SLACK_APP_TOKEN` takes precedence.
    pub app_token: String,
    /// Channel id whose top-level messages are parsed for gifts.
    pub channel: String,
    pub api_base_url: String,
    pub stats_command: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            app_token: String::new(),
            channel: String::new(),
            api_base_url: "https://slack.com/api".to_string(),
            stats_command: "/beer-stats".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GiftsConfig {
    /// Pictographs and textual aliases that count as one unit each.
    pub markers: Vec<String>,
    pub quantity_mode: QuantityMode,
}

impl Default for GiftsConfig {
    fn default() -> Self {
        Self {
            markers: vec!["🍺".to_string(), ":beer:".to_string()],
            quantity_mode: QuantityMode::Markers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_per_day: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { max_per_day: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: String,
    /// Processed-event markers older than this are pruned once a day.
    /// `0` keeps them forever.
    pub dedup_retention_days: u64,
    pub busy_timeout_ms: u64,
    /// Claim and confirm gifts without writing them to the ledger.
    pub read_only: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: "data/beerbot.db".to_string(),
            dedup_retention_days: 30,
            busy_timeout_ms: 5_000,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    pub connect_timeout_secs: u64,
    /// Period of the identity probe. `0` disables the liveness monitor.
    pub liveness_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Upper bound on events processed concurrently.
    pub max_in_flight: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_cap_secs: 60,
            connect_timeout_secs: 10,
            liveness_interval_secs: 60,
            probe_timeout_secs: 10,
            max_in_flight: 8,
        }
    }
}

impl SupervisorConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Option<Duration> {
        (self.liveness_interval_secs > 0).then(|| Duration::from_secs(self.liveness_interval_secs))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    /// How long in-flight queries may run after shutdown is requested.
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/beerbot.sock".to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Log every raw transport envelope at debug level.
    pub trace_events: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            trace_events: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub slack: SlackConfig,
    pub gifts: GiftsConfig,
    pub quota: QuotaConfig,
    pub ledger: LedgerConfig,
    pub supervisor: SupervisorConfig,
    pub daemon: DaemonConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load the config at `path`, falling back to defaults when the file does
    /// not exist, then apply secret overrides from the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if let Ok(token) = env::var("SLACK_BOT_TOKEN") {
            if !token.is_empty() {
                config.slack.bot_token = token;
            }
        }
        if let Ok(token) = env::var("SLACK_APP_TOKEN") {
            if !token.is_empty() {
                config.slack.app_token = token;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Write)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered).map_err(ConfigError::Write)?;
        Ok(())
    }

    /// Check everything the service needs before it touches the network.
    /// Creates the ledger directory when it is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slack.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingCredential("slack.bot_token"));
        }
        if self.slack.app_token.trim().is_empty() {
            return Err(ConfigError::MissingCredential("slack.app_token"));
        }
        if self.slack.channel.trim().is_empty() {
            return Err(ConfigError::MissingChannel);
        }
        if self.quota.max_per_day == 0 {
            return Err(ConfigError::InvalidQuota);
        }
        self.associator()?;
        self.validate_supervisor()?;
        self.ensure_ledger_dir()
    }

    /// Build the associator for the configured markers and mode. A written
    /// quantity never exceeds the daily allowance.
    pub fn associator(&self) -> Result<GiftAssociator, ConfigError> {
        if self.gifts.markers.iter().all(|m| m.trim().is_empty()) {
            return Err(ConfigError::NoMarkers);
        }
        let max_quantity = u32::try_from(self.quota.max_per_day).unwrap_or(u32::MAX);
        GiftAssociator::new(&self.gifts.markers, self.gifts.quantity_mode)
            .map(|associator| associator.with_max_quantity(max_quantity))
            .map_err(|err| ConfigError::InvalidMarkers(err.to_string()))
    }

    fn validate_supervisor(&self) -> Result<(), ConfigError> {
        let sup = &self.supervisor;
        if sup.backoff_base_ms == 0 {
            return Err(ConfigError::InvalidBackoff("backoff_base_ms must be positive"));
        }
        if sup.backoff_cap() < sup.backoff_base() {
            return Err(ConfigError::InvalidBackoff(
                "backoff_cap_secs must not be shorter than backoff_base_ms",
            ));
        }
        if sup.max_in_flight == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(())
    }

    /// Create the directory holding the ledger database if it is missing.
    pub fn ensure_ledger_dir(&self) -> Result<(), ConfigError> {
        let Some(dir) = Path::new(&self.ledger.path).parent() else {
            return Ok(());
        };
        if dir.as_os_str().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|source| ConfigError::LedgerPath {
            path: dir.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use tempfile::TempDir;

    /// Serialises every test that reads or writes the token variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn valid_config(dir: &TempDir) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.slack.bot_token = "xoxb-test".to_string();
        cfg.slack.app_token = "xapp-test".to_string();
        cfg.slack.channel = "C123".to_string();
        cfg.ledger.path = dir.path().join("db/beers.db").display().to_string();
        cfg
    }

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.gifts.markers, vec!["🍺", ":beer:"]);
        assert_eq!(cfg.gifts.quantity_mode, QuantityMode::Markers);
        assert_eq!(cfg.quota.max_per_day, 10);
        assert_eq!(cfg.ledger.dedup_retention_days, 30);
        assert!(!cfg.ledger.read_only);
        assert_eq!(cfg.supervisor.backoff_base(), Duration::from_millis(500));
        assert_eq!(cfg.supervisor.backoff_cap(), Duration::from_secs(60));
        assert_eq!(cfg.daemon.socket_path, "/tmp/beerbot.sock");
        assert_eq!(cfg.slack.stats_command, "/beer-stats");
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(!cfg.telemetry.trace_events);
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let _env = env_guard();
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.quota.max_per_day, 10);
        assert_eq!(cfg.slack.api_base_url, "https://slack.com/api");
    }

    #[test]
    fn load_from_valid_toml() {
        let _env = env_guard();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[slack]
channel = "C42"

[gifts]
markers = [":taco:"]
quantity_mode = "numeral"

[quota]
max_per_day = 3

[ledger]
path = "/var/lib/beerbot/ledger.db"
dedup_retention_days = 0
read_only = true
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.slack.channel, "C42");
        assert_eq!(cfg.gifts.markers, vec![":taco:"]);
        assert_eq!(cfg.gifts.quantity_mode, QuantityMode::Numeral);
        assert_eq!(cfg.quota.max_per_day, 3);
        assert_eq!(cfg.ledger.path, "/var/lib/beerbot/ledger.db");
        assert_eq!(cfg.ledger.dedup_retention_days, 0);
        assert!(cfg.ledger.read_only);
        // Unspecified sections keep their defaults
        assert_eq!(cfg.supervisor.max_in_flight, 8);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let _env = env_guard();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_tokens_override_config() {
        let _env = env_guard();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[slack]
bot_token = "xoxb-from-file"
app_token = "xapp-from-file"
"#,
        )
        .unwrap();

        // SAFETY: every test that touches the environment holds ENV_LOCK.
        unsafe {
            env::set_var("SLACK_BOT_TOKEN", "xoxb-from-env");
            env::set_var("SLACK_APP_TOKEN", "xapp-from-env");
        }
        let cfg = AppConfig::load_from(&path).unwrap();
        unsafe {
            env::remove_var("SLACK_BOT_TOKEN");
            env::remove_var("SLACK_APP_TOKEN");
        }
        assert_eq!(cfg.slack.bot_token, "xoxb-from-env");
        assert_eq!(cfg.slack.app_token, "xapp-from-env");
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let _env = env_guard();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.slack.channel = "CROUND".to_string();
        cfg.gifts.quantity_mode = QuantityMode::Numeral;
        cfg.supervisor.backoff_cap_secs = 120;

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.slack.channel, "CROUND");
        assert_eq!(loaded.gifts.quantity_mode, QuantityMode::Numeral);
        assert_eq!(loaded.supervisor.backoff_cap_secs, 120);
    }

    // ── validate ───────────────────────────────────────────────────────────

    #[test]
    fn validate_accepts_complete_config_and_creates_ledger_dir() {
        let dir = TempDir::new().unwrap();
        let cfg = valid_config(&dir);
        cfg.validate().unwrap();
        assert!(dir.path().join("db").is_dir());
    }

    #[test]
    fn validate_rejects_missing_credentials_and_channel() {
        let dir = TempDir::new().unwrap();

        let mut cfg = valid_config(&dir);
        cfg.slack.bot_token.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingCredential("slack.bot_token"))
        ));

        let mut cfg = valid_config(&dir);
        cfg.slack.app_token = "  ".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingCredential("slack.app_token"))
        ));

        let mut cfg = valid_config(&dir);
        cfg.slack.channel.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingChannel)));
    }

    #[test]
    fn validate_rejects_zero_quota_and_empty_markers() {
        let dir = TempDir::new().unwrap();

        let mut cfg = valid_config(&dir);
        cfg.quota.max_per_day = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidQuota)));

        let mut cfg = valid_config(&dir);
        cfg.gifts.markers = vec![" ".to_string()];
        assert!(matches!(cfg.validate(), Err(ConfigError::NoMarkers)));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let dir = TempDir::new().unwrap();
        let mut cfg = valid_config(&dir);
        cfg.supervisor.backoff_base_ms = 10_000;
        cfg.supervisor.backoff_cap_secs = 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidBackoff(_))));

        let mut cfg = valid_config(&dir);
        cfg.supervisor.max_in_flight = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConcurrency)));
    }

    #[test]
    fn validate_reports_uncreatable_ledger_dir() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let mut cfg = valid_config(&dir);
        cfg.ledger.path = blocker.join("nested/beers.db").display().to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::LedgerPath { .. })));
    }

    #[test]
    fn associator_caps_numerals_at_daily_allowance() {
        let mut cfg = AppConfig::default();
        cfg.gifts.quantity_mode = QuantityMode::Numeral;
        cfg.quota.max_per_day = 5;
        let gifts = cfg.associator().unwrap().associate("<@U1> 4294967295 🍺");
        assert_eq!(gifts.get("U1"), Some(&5));
    }

    #[test]
    fn quantity_mode_serde() {
        let json = serde_json::to_string(&QuantityMode::Numeral).unwrap();
        assert_eq!(json, "\"numeral\"");
    }

    #[test]
    fn liveness_interval_zero_disables_monitor() {
        let mut sup = SupervisorConfig::default();
        assert_eq!(sup.liveness_interval(), Some(Duration::from_secs(60)));
        sup.liveness_interval_secs = 0;
        assert_eq!(sup.liveness_interval(), None);
    }
}
