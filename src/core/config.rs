use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Packet identifiers are 16-bit, so a pack can never hold more distinct ones.
const MAX_PACK_RECORDS: usize = u16::MAX as usize;

/// Top-level configuration for the persistent-delivery core.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Upper bound of a single log poll; also the backoff after a failed batch.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a pack waits for acknowledgements before unacked packets fail.
    #[serde(default = "default_pack_processing_timeout_ms")]
    pub pack_processing_timeout_ms: u64,
    /// Grace period `stop_processing` grants a worker to exit.
    #[serde(default = "default_stop_processing_timeout_ms")]
    pub stop_processing_timeout_ms: u64,
    #[serde(default)]
    pub submit_strategy: SubmitStrategyKind,
    #[serde(default)]
    pub ack_strategy: AckStrategyConfig,
}

impl ProcessingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pack_processing_timeout(&self) -> Duration {
        Duration::from_millis(self.pack_processing_timeout_ms)
    }

    pub fn stop_processing_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_processing_timeout_ms)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            pack_processing_timeout_ms: default_pack_processing_timeout_ms(),
            stop_processing_timeout_ms: default_stop_processing_timeout_ms(),
            submit_strategy: SubmitStrategyKind::default(),
            ack_strategy: AckStrategyConfig::default(),
        }
    }
}

/// How a pack is pushed to the client.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStrategyKind {
    /// Every pending message back to back.
    #[default]
    Burst,
    /// One message at a time, the next only after the previous was acked.
    Sequential,
}

impl FromStr for SubmitStrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "burst" => Ok(Self::Burst),
            "sequential" => Ok(Self::Sequential),
            other => bail!("invalid processing.submit_strategy {}", other),
        }
    }
}

/// Commit-or-retry policy applied once a pack is resolved.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AckStrategyConfig {
    /// Commit only when every packet was acked; retry the rest forever.
    #[default]
    AllOrNothing,
    /// Retry unacked packets for `max_retries` rounds, then commit past them.
    SkipFailedAfterRetries { max_retries: u32 },
    /// Commit after the first round whatever the outcome.
    SkipAll,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogBackend {
    #[default]
    Memory,
    File,
}

impl FromStr for LogBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            other => bail!("invalid log.backend {}", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub backend: LogBackend,
    /// Root directory of the file backend.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Client topics are named `<topic_prefix><client id>`.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Upper bound of records returned by one poll, i.e. of one pack.
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackend::default(),
            data_dir: default_data_dir(),
            topic_prefix: default_topic_prefix(),
            max_poll_records: default_max_poll_records(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from `path`, falling back to QUANTUM_PERSIST_CONFIG and
    /// then `config/quantum-persist.toml`, and apply the QUANTUM_PERSIST_* overrides.
    pub fn load_from_env(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(env_config_path);
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let processing = &self.processing;
        if processing.poll_interval_ms == 0 {
            bail!("processing.poll_interval_ms must be > 0");
        }
        if processing.pack_processing_timeout_ms == 0 {
            bail!("processing.pack_processing_timeout_ms must be > 0");
        }
        if processing.stop_processing_timeout_ms == 0 {
            bail!("processing.stop_processing_timeout_ms must be > 0");
        }
        if let AckStrategyConfig::SkipFailedAfterRetries { max_retries: 0 } =
            processing.ack_strategy
        {
            bail!("processing.ack_strategy.max_retries must be > 0");
        }
        if self.log.max_poll_records == 0 || self.log.max_poll_records > MAX_PACK_RECORDS {
            bail!("log.max_poll_records must be within 1..={MAX_PACK_RECORDS}");
        }
        if self.log.topic_prefix.is_empty() {
            bail!("log.topic_prefix must be non-empty");
        }
        if self.log.backend == LogBackend::File && self.log.data_dir.as_os_str().is_empty() {
            bail!("log.data_dir must be set for the file backend");
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(ms) = env_millis("QUANTUM_PERSIST_POLL_INTERVAL_MS")? {
            self.processing.poll_interval_ms = ms;
        }
        if let Some(ms) = env_millis("QUANTUM_PERSIST_PACK_TIMEOUT_MS")? {
            self.processing.pack_processing_timeout_ms = ms;
        }
        if let Some(ms) = env_millis("QUANTUM_PERSIST_STOP_TIMEOUT_MS")? {
            self.processing.stop_processing_timeout_ms = ms;
        }
        if let Ok(kind) = std::env::var("QUANTUM_PERSIST_SUBMIT_STRATEGY") {
            self.processing.submit_strategy = SubmitStrategyKind::from_str(&kind)?;
        }
        if let Ok(backend) = std::env::var("QUANTUM_PERSIST_LOG_BACKEND") {
            self.log.backend = LogBackend::from_str(&backend)?;
        }
        Ok(())
    }
}

fn env_millis(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{key} must be a duration in milliseconds")),
        Err(_) => Ok(None),
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("QUANTUM_PERSIST_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/quantum-persist.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_pack_processing_timeout_ms() -> u64 {
    20_000
}

fn default_stop_processing_timeout_ms() -> u64 {
    100
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/persisted")
}

fn default_topic_prefix() -> String {
    "mqtt_broker_application_client_".into()
}

fn default_max_poll_records() -> usize {
    500
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Serialises tests that touch process-wide QUANTUM_PERSIST_* variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const FULL_DOC: &str = r#"
[processing]
poll_interval_ms = 250
pack_processing_timeout_ms = 5000
stop_processing_timeout_ms = 50
submit_strategy = "sequential"

[processing.ack_strategy]
type = "skip_failed_after_retries"
max_retries = 3

[log]
backend = "file"
data_dir = "/var/lib/quantum/persisted"
max_poll_records = 64

[telemetry]
log_level = "debug"
"#;

    #[test]
    fn parses_full_toml_document() {
        let cfg: Config = toml::from_str(FULL_DOC).unwrap();
        assert_eq!(cfg.processing.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.processing.submit_strategy, SubmitStrategyKind::Sequential);
        assert_eq!(
            cfg.processing.ack_strategy,
            AckStrategyConfig::SkipFailedAfterRetries { max_retries: 3 }
        );
        assert_eq!(cfg.log.backend, LogBackend::File);
        assert_eq!(cfg.log.max_poll_records, 64);
        assert_eq!(cfg.log.topic_prefix, "mqtt_broker_application_client_");
        assert_eq!(cfg.telemetry.log_level.as_deref(), Some("debug"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.processing.pack_processing_timeout_ms, 20_000);
        assert_eq!(cfg.processing.stop_processing_timeout(), Duration::from_millis(100));
        assert_eq!(cfg.processing.ack_strategy, AckStrategyConfig::AllOrNothing);
        assert_eq!(cfg.processing.submit_strategy, SubmitStrategyKind::Burst);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_retries_and_oversized_packs() {
        let mut cfg = Config::default();
        cfg.processing.ack_strategy = AckStrategyConfig::SkipFailedAfterRetries { max_retries: 0 };
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("max_retries"));

        let mut cfg = Config::default();
        cfg.log.max_poll_records = 70_000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.processing.pack_processing_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_json_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.json");
        fs::write(
            &path,
            r#"{"processing": {"poll_interval_ms": 10, "ack_strategy": {"type": "skip_all"}}}"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.processing.poll_interval_ms, 10);
        assert_eq!(cfg.processing.ack_strategy, AckStrategyConfig::SkipAll);
    }

    #[test]
    fn env_override_replaces_pack_timeout() {
        let _env = ENV_LOCK.lock();
        let mut cfg = Config::default();
        std::env::set_var("QUANTUM_PERSIST_PACK_TIMEOUT_MS", "1500");
        cfg.apply_env_overrides().unwrap();
        std::env::remove_var("QUANTUM_PERSIST_PACK_TIMEOUT_MS");
        assert_eq!(cfg.processing.pack_processing_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn load_from_env_applies_overrides_to_explicit_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.toml");
        fs::write(&path, "[processing]\nstop_processing_timeout_ms = 50\n").unwrap();
        let _env = ENV_LOCK.lock();
        std::env::set_var("QUANTUM_PERSIST_STOP_TIMEOUT_MS", "750");
        std::env::set_var("QUANTUM_PERSIST_LOG_BACKEND", "File");
        let cfg = Config::load_from_env(Some(&path));
        std::env::remove_var("QUANTUM_PERSIST_STOP_TIMEOUT_MS");
        std::env::remove_var("QUANTUM_PERSIST_LOG_BACKEND");
        let cfg = cfg.unwrap();
        assert_eq!(cfg.processing.stop_processing_timeout_ms, 750);
        assert_eq!(cfg.log.backend, LogBackend::File);
    }

    #[test]
    fn invalid_env_strategy_is_rejected() {
        let _env = ENV_LOCK.lock();
        let mut cfg = Config::default();
        std::env::set_var("QUANTUM_PERSIST_SUBMIT_STRATEGY", "parallel");
        let result = cfg.apply_env_overrides();
        std::env::remove_var("QUANTUM_PERSIST_SUBMIT_STRATEGY");
        assert!(result.is_err());
    }

    #[test]
    fn strategy_names_parse_case_insensitively() {
        assert_eq!(
            SubmitStrategyKind::from_str("Sequential").unwrap(),
            SubmitStrategyKind::Sequential
        );
        assert_eq!(LogBackend::from_str("FILE").unwrap(), LogBackend::File);
        assert!(LogBackend::from_str("kafka").is_err());
    }
}
