//! Configuration module for boxsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for boxsync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
    pub transfers: TransferConfig,
    pub notifications: NotificationConfig,
    pub quota: QuotaConfig,
    pub conflicts: ConflictsConfig,
    pub index: IndexConfig,
    pub logging: LoggingConfig,
}

/// Server endpoint and identity of this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the REST API, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Identifier of this device as registered with the server.
    pub device_id: String,
    /// Syncbox mirrored by this engine.
    pub syncbox_id: i64,
    /// Timeout for a single network call, in seconds.
    pub request_timeout_secs: u64,
}

/// Credential sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// API key. May also come from `BOXSYNC_KEY`.
    pub key: Option<String>,
    /// API secret. May also come from `BOXSYNC_SECRET`.
    pub secret: Option<String>,
    /// YAML file holding `key`, `secret` and `token`; re-read when the
    /// server rejects the current credentials.
    pub credentials_file: Option<PathBuf>,
}

/// Local folder and change detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory mirrored with the syncbox.
    pub root: PathBuf,
    /// Quiet window before a burst of events for one path is emitted, in milliseconds.
    pub debounce_ms: u64,
    /// File-name suffixes that are never synced (editor swap files, etc.).
    pub ignore_suffixes: Vec<String>,
}

/// Transfer scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum concurrent uploads.
    pub upload_concurrent: u32,
    /// Maximum concurrent downloads.
    pub download_concurrent: u32,
    /// Tasks a lane accepts before submission blocks the caller.
    pub queue_depth: u32,
    /// Attempts per task, including the first one.
    pub max_attempts: u32,
    /// First retry delay, in milliseconds; doubled on every attempt.
    pub backoff_base_ms: u64,
    /// Upper bound for a retry delay, in milliseconds.
    pub backoff_max_ms: u64,
    /// Content chunk size, in KiB. Cancellation is checked between chunks.
    pub chunk_size_kb: u64,
}

/// Push channel and polling fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Subscribe to the push channel. When false the engine only polls.
    pub push_enabled: bool,
    /// Seconds between manual polls while the push channel is down.
    pub poll_interval_secs: u64,
    /// First reconnection delay, in seconds.
    pub reconnect_base_secs: u64,
    /// Upper bound for the reconnection delay, in seconds.
    pub reconnect_max_secs: u64,
}

/// Quota refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Seconds between quota refreshes.
    pub refresh_interval_secs: u64,
}

/// Conflict handling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Keep the losing local version as a `(conflicted copy ...)` file.
    pub keep_local_copy: bool,
}

/// Local index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Path of the SQLite index file.
    pub path: PathBuf,
    /// Days to keep completed events before pruning.
    pub event_retention_days: u32,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/boxsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("boxsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Duration accessors
// ---------------------------------------------------------------------------

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl TransferConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn chunk_size(&self) -> usize {
        (self.chunk_size_kb as usize).saturating_mul(1024)
    }
}

impl NotificationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

impl QuotaConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Config::default()
// ---------------------------------------------------------------------------

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.boxsync.invalid".to_string(),
            device_id: "unregistered-device".to_string(),
            syncbox_id: 0,
            request_timeout_secs: 30,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Boxsync"),
            debounce_ms: 500,
            ignore_suffixes: vec![
                ".swp".to_string(),
                ".swx".to_string(),
                "~".to_string(),
                ".boxsync-partial".to_string(),
            ],
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_concurrent: 3,
            download_concurrent: 3,
            queue_depth: 64,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            chunk_size_kb: 1_024,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            poll_interval_secs: 30,
            reconnect_base_secs: 2,
            reconnect_max_secs: 300,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            keep_local_copy: true,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("boxsync");
        Self {
            path: data_dir.join("index.db"),
            event_retention_days: 7,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"transfers.max_attempts"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid. The sync root is
    /// only checked for being absolute here; whether it exists is checked
    /// by the engine at start.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- server ---
        if url::Url::parse(&self.server.base_url).is_err() {
            errors.push(ValidationError {
                field: "server.base_url".into(),
                message: format!("not a valid URL: {}", self.server.base_url),
            });
        }
        if self.server.device_id.trim().is_empty() {
            errors.push(ValidationError {
                field: "server.device_id".into(),
                message: "must not be empty".into(),
            });
        }
        positive(
            &mut errors,
            "server.request_timeout_secs",
            self.server.request_timeout_secs,
        );

        // --- sync ---
        if !self.sync.root.is_absolute() {
            errors.push(ValidationError {
                field: "sync.root".into(),
                message: format!("must be an absolute path: {}", self.sync.root.display()),
            });
        }
        positive(&mut errors, "sync.debounce_ms", self.sync.debounce_ms);
        if self.sync.ignore_suffixes.iter().any(String::is_empty) {
            errors.push(ValidationError {
                field: "sync.ignore_suffixes".into(),
                message: "must not contain empty entries".into(),
            });
        }

        // --- transfers ---
        positive(
            &mut errors,
            "transfers.upload_concurrent",
            self.transfers.upload_concurrent.into(),
        );
        positive(
            &mut errors,
            "transfers.download_concurrent",
            self.transfers.download_concurrent.into(),
        );
        positive(&mut errors, "transfers.queue_depth", self.transfers.queue_depth.into());
        positive(&mut errors, "transfers.max_attempts", self.transfers.max_attempts.into());
        positive(&mut errors, "transfers.chunk_size_kb", self.transfers.chunk_size_kb);
        if self.transfers.backoff_max_ms < self.transfers.backoff_base_ms {
            errors.push(ValidationError {
                field: "transfers.backoff_max_ms".into(),
                message: format!(
                    "backoff_max_ms ({}) must not be below backoff_base_ms ({})",
                    self.transfers.backoff_max_ms, self.transfers.backoff_base_ms
                ),
            });
        }

        // --- notifications ---
        positive(
            &mut errors,
            "notifications.poll_interval_secs",
            self.notifications.poll_interval_secs,
        );
        positive(
            &mut errors,
            "notifications.reconnect_base_secs",
            self.notifications.reconnect_base_secs,
        );
        if self.notifications.reconnect_max_secs < self.notifications.reconnect_base_secs {
            errors.push(ValidationError {
                field: "notifications.reconnect_max_secs".into(),
                message: "must not be below reconnect_base_secs".into(),
            });
        }

        // --- quota ---
        positive(
            &mut errors,
            "quota.refresh_interval_secs",
            self.quota.refresh_interval_secs,
        );

        // --- index ---
        if self.index.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "index.path".into(),
                message: "must not be empty".into(),
            });
        }
        if self.index.path.starts_with(&self.sync.root) {
            errors.push(ValidationError {
                field: "index.path".into(),
                message: "must not live inside the sync root".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Config`]. Starts from defaults.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder pre-populated with [`Config::default`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- server ---

    pub fn server_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.server.base_url = url.into();
        self
    }

    pub fn server_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.config.server.device_id = device_id.into();
        self
    }

    pub fn server_syncbox_id(mut self, syncbox_id: i64) -> Self {
        self.config.server.syncbox_id = syncbox_id;
        self
    }

    pub fn server_request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.server.request_timeout_secs = secs;
        self
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_debounce_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_ms = ms;
        self
    }

    // --- transfers ---

    pub fn transfers_upload_concurrent(mut self, n: u32) -> Self {
        self.config.transfers.upload_concurrent = n;
        self
    }

    pub fn transfers_download_concurrent(mut self, n: u32) -> Self {
        self.config.transfers.download_concurrent = n;
        self
    }

    pub fn transfers_max_attempts(mut self, n: u32) -> Self {
        self.config.transfers.max_attempts = n;
        self
    }

    pub fn transfers_backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.config.transfers.backoff_base_ms = base;
        self.config.transfers.backoff_max_ms = max;
        self
    }

    pub fn transfers_chunk_size_kb(mut self, kb: u64) -> Self {
        self.config.transfers.chunk_size_kb = kb;
        self
    }

    // --- notifications ---

    pub fn notifications_push_enabled(mut self, enabled: bool) -> Self {
        self.config.notifications.push_enabled = enabled;
        self
    }

    pub fn notifications_poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.notifications.poll_interval_secs = secs;
        self
    }

    // --- quota ---

    pub fn quota_refresh_interval_secs(mut self, secs: u64) -> Self {
        self.config.quota.refresh_interval_secs = secs;
        self
    }

    // --- conflicts ---

    pub fn conflicts_keep_local_copy(mut self, keep: bool) -> Self {
        self.config.conflicts.keep_local_copy = keep;
        self
    }

    // --- index ---

    pub fn index_path(mut self, path: PathBuf) -> Self {
        self.config.index.path = path;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.debounce_ms, 500);
        assert!(cfg.sync.root.to_string_lossy().contains("Boxsync"));
        assert_eq!(cfg.transfers.upload_concurrent, 3);
        assert_eq!(cfg.transfers.download_concurrent, 3);
        assert_eq!(cfg.transfers.max_attempts, 5);
        assert_eq!(cfg.transfers.chunk_size(), 1024 * 1024);
        assert_eq!(cfg.notifications.poll_interval(), Duration::from_secs(30));
        assert_eq!(cfg.quota.refresh_interval_secs, 300);
        assert!(cfg.conflicts.keep_local_copy);
        assert_eq!(cfg.index.event_retention_days, 7);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(cfg.auth.key.is_none());
    }

    #[test]
    fn default_config_passes_validation() {
        let cfg = Config::default();
        let errors = cfg.validate();
        // home may be relative on odd CI machines, filter that out
        let non_root_errors: Vec<_> = errors.iter().filter(|e| e.field != "sync.root").collect();
        assert!(
            non_root_errors.is_empty(),
            "unexpected validation errors: {non_root_errors:?}"
        );
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
server:
  base_url: https://sync.example.com
  device_id: laptop-01
  syncbox_id: 42
  request_timeout_secs: 10
auth:
  key: k1
  credentials_file: /tmp/creds.yaml
sync:
  root: /tmp/test-box
  debounce_ms: 250
  ignore_suffixes: [".swp"]
transfers:
  upload_concurrent: 2
  download_concurrent: 4
  queue_depth: 16
  max_attempts: 3
  backoff_base_ms: 100
  backoff_max_ms: 800
  chunk_size_kb: 64
notifications:
  push_enabled: false
  poll_interval_secs: 15
  reconnect_base_secs: 1
  reconnect_max_secs: 60
quota:
  refresh_interval_secs: 120
conflicts:
  keep_local_copy: false
index:
  path: /tmp/index/box.db
  event_retention_days: 3
logging:
  level: debug
  json: true
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.server.base_url, "https://sync.example.com");
        assert_eq!(cfg.server.device_id, "laptop-01");
        assert_eq!(cfg.server.syncbox_id, 42);
        assert_eq!(cfg.server.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.auth.key.as_deref(), Some("k1"));
        assert_eq!(cfg.auth.credentials_file, Some(PathBuf::from("/tmp/creds.yaml")));
        assert_eq!(cfg.sync.root, PathBuf::from("/tmp/test-box"));
        assert_eq!(cfg.sync.debounce(), Duration::from_millis(250));
        assert_eq!(cfg.sync.ignore_suffixes, vec![".swp".to_string()]);
        assert_eq!(cfg.transfers.upload_concurrent, 2);
        assert_eq!(cfg.transfers.download_concurrent, 4);
        assert_eq!(cfg.transfers.backoff_max(), Duration::from_millis(800));
        assert_eq!(cfg.transfers.chunk_size(), 64 * 1024);
        assert!(!cfg.notifications.push_enabled);
        assert_eq!(cfg.notifications.reconnect_max(), Duration::from_secs(60));
        assert_eq!(cfg.quota.refresh_interval(), Duration::from_secs(120));
        assert!(!cfg.conflicts.keep_local_copy);
        assert_eq!(cfg.index.path, PathBuf::from("/tmp/index/box.db"));
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"sync:\n  root: /tmp/partial\n").unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.root, PathBuf::from("/tmp/partial"));
        assert_eq!(cfg.sync.debounce_ms, 500);
        assert_eq!(cfg.transfers.max_attempts, 5);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.sync.debounce_ms, 500);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }

    // -- Validation --

    #[test]
    fn validate_catches_zero_values() {
        let mut cfg = Config::default();
        cfg.sync.debounce_ms = 0;
        cfg.transfers.upload_concurrent = 0;
        cfg.transfers.download_concurrent = 0;
        cfg.transfers.max_attempts = 0;
        cfg.notifications.poll_interval_secs = 0;
        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"sync.debounce_ms".to_string()));
        assert!(fields.contains(&"transfers.upload_concurrent".to_string()));
        assert!(fields.contains(&"transfers.download_concurrent".to_string()));
        assert!(fields.contains(&"transfers.max_attempts".to_string()));
        assert!(fields.contains(&"notifications.poll_interval_secs".to_string()));
    }

    #[test]
    fn validate_catches_bad_url_and_level() {
        let mut cfg = Config::default();
        cfg.server.base_url = "not a url".into();
        cfg.logging.level = "verbose".into();
        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"server.base_url".to_string()));
        assert!(fields.contains(&"logging.level".to_string()));
    }

    #[test]
    fn validate_catches_inverted_backoff() {
        let mut cfg = Config::default();
        cfg.transfers.backoff_base_ms = 5_000;
        cfg.transfers.backoff_max_ms = 1_000;
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "transfers.backoff_max_ms"));
    }

    #[test]
    fn validate_rejects_index_inside_root() {
        let cfg = ConfigBuilder::new()
            .sync_root(PathBuf::from("/tmp/root"))
            .index_path(PathBuf::from("/tmp/root/.index.db"))
            .build();
        assert!(cfg.validate().iter().any(|e| e.field == "index.path"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            field: "sync.debounce_ms".into(),
            message: "must be greater than 0".into(),
        };
        assert_eq!(err.to_string(), "sync.debounce_ms: must be greater than 0");
    }

    // -- Builder --

    #[test]
    fn builder_overrides_defaults() {
        let cfg = ConfigBuilder::new()
            .server_base_url("http://127.0.0.1:9000")
            .server_device_id("dev")
            .server_syncbox_id(7)
            .sync_root(PathBuf::from("/tmp/b"))
            .sync_debounce_ms(50)
            .transfers_upload_concurrent(1)
            .transfers_download_concurrent(2)
            .transfers_max_attempts(2)
            .transfers_backoff_ms(10, 20)
            .notifications_push_enabled(false)
            .conflicts_keep_local_copy(false)
            .index_path(PathBuf::from("/tmp/idx.db"))
            .logging_level("debug")
            .build_validated()
            .expect("valid config");
        assert_eq!(cfg.server.syncbox_id, 7);
        assert_eq!(cfg.sync.debounce_ms, 50);
        assert_eq!(cfg.transfers.upload_concurrent, 1);
        assert_eq!(cfg.transfers.backoff_base(), Duration::from_millis(10));
        assert!(!cfg.notifications.push_enabled);
        assert!(!cfg.conflicts.keep_local_copy);
    }

    #[test]
    fn builder_build_validated_reports_errors() {
        let result = ConfigBuilder::new()
            .transfers_max_attempts(0)
            .logging_level("loud")
            .build_validated();
        let errors = result.unwrap_err();
        assert!(errors.iter().any(|e| e.field == "transfers.max_attempts"));
        assert!(errors.iter().any(|e| e.field == "logging.level"));
    }
}
