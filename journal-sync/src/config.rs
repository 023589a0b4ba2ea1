//! Configuration for the engine, the local store and the remotes
//!
//! Every struct has a `Default` matching the desktop app's behaviour and a
//! `from_env()` that overrides fields from `JOURNAL_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use journal_crypto::kdf::MAX_ITERATIONS;

use crate::conflict::ConflictPolicy;
use crate::error::{SyncError, SyncResult};

/// Sync engine timing and policy.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last local mutation before uploading.
    pub debounce: Duration,
    /// Interval between remote version checks.
    pub poll_interval: Duration,
    /// Allowance for clock drift when comparing against a client-stamped
    /// watermark.
    pub clock_skew_tolerance: Duration,
    /// PBKDF2 iterations used when sealing new blobs.
    pub kdf_iterations: u32,
    /// Arm the debounce timer on local mutations.
    pub auto_sync: bool,
    pub conflict_policy: ConflictPolicy,
    /// Download the remote copy after unlock when this device never synced.
    pub initial_download: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(5000),
            poll_interval: Duration::from_secs(120),
            clock_skew_tolerance: Duration::from_millis(2000),
            kdf_iterations: 600_000,
            auto_sync: true,
            conflict_policy: ConflictPolicy::Manual,
            initial_download: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("JOURNAL_DEBOUNCE_MS")? {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("JOURNAL_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("JOURNAL_CLOCK_SKEW_TOLERANCE_MS")? {
            config.clock_skew_tolerance = Duration::from_millis(ms);
        }
        if let Some(iterations) = env_parse("JOURNAL_KDF_ITERATIONS")? {
            config.kdf_iterations = iterations;
        }
        if let Some(auto_sync) = env_parse("JOURNAL_AUTO_SYNC")? {
            config.auto_sync = auto_sync;
        }
        if let Some(policy) = env_parse("JOURNAL_CONFLICT_POLICY")? {
            config.conflict_policy = policy;
        }
        if let Some(initial) = env_parse("JOURNAL_INITIAL_DOWNLOAD")? {
            config.initial_download = initial;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.poll_interval.is_zero() {
            return Err(SyncError::Configuration(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.kdf_iterations == 0 || self.kdf_iterations > MAX_ITERATIONS {
            return Err(SyncError::Configuration(format!(
                "KDF iterations must be between 1 and {MAX_ITERATIONS}, got {}",
                self.kdf_iterations
            )));
        }
        Ok(())
    }
}

/// Local SQLite store settings.
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    pub db_path: PathBuf,
    pub max_connections: u32,
    pub enable_wal: bool,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("class_journal.db"),
            max_connections: 5,
            enable_wal: true,
        }
    }
}

impl LocalStoreConfig {
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("JOURNAL_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(max) = env_parse("JOURNAL_DB_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        Ok(config)
    }
}

/// HTTP remote blob store settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub base_url: String,
    /// Public API key sent as the `apikey` header.
    pub api_key: Option<String>,
    pub table: String,
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            table: "user_journal_data".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_env() -> SyncResult<Self> {
        let base_url = std::env::var("JOURNAL_REMOTE_URL").map_err(|_| {
            SyncError::Configuration("JOURNAL_REMOTE_URL is required for the HTTP remote".to_string())
        })?;

        let mut config = Self::new(base_url);
        config.api_key = std::env::var("JOURNAL_REMOTE_API_KEY").ok();
        if let Ok(table) = std::env::var("JOURNAL_REMOTE_TABLE") {
            config.table = table;
        }
        if let Some(secs) = env_parse::<u64>("JOURNAL_REMOTE_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SyncError::Configuration(format!(
                "remote URL must start with http:// or https://, got {}",
                self.base_url
            )));
        }
        if self.table.is_empty() {
            return Err(SyncError::Configuration("remote table must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Google Drive remote settings. The blob is one JSON file in the signed-in
/// account's Drive.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// Files endpoint used for search, metadata and download.
    pub api_url: String,
    /// Files endpoint used for multipart create and update.
    pub upload_url: String,
    pub file_name: String,
    pub timeout: Duration,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_url: "https://www.googleapis.com/drive/v3/files".to_string(),
            upload_url: "https://www.googleapis.com/upload/drive/v3/files".to_string(),
            file_name: "class_journal_backup.json".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl DriveConfig {
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("JOURNAL_DRIVE_API_URL") {
            config.api_url = url;
        }
        if let Ok(url) = std::env::var("JOURNAL_DRIVE_UPLOAD_URL") {
            config.upload_url = url;
        }
        if let Ok(name) = std::env::var("JOURNAL_DRIVE_FILE_NAME") {
            config.file_name = name;
        }
        if let Some(secs) = env_parse::<u64>("JOURNAL_REMOTE_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        for url in [&self.api_url, &self.upload_url] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SyncError::Configuration(format!(
                    "Drive URL must start with http:// or https://, got {url}"
                )));
            }
        }
        if self.file_name.trim().is_empty() {
            return Err(SyncError::Configuration("Drive file name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Parse an optional environment variable; present but invalid is an error.
fn env_parse<T>(name: &str) -> SyncResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SyncError::Configuration(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
