//! Engine configuration.
//!
//! [`EngineConfig`] is passed explicitly to every transfer and to the HTTP
//! transport; nothing reads global state. Values can come from code (the
//! `with_*` builders) or from an INI file:
//!
//! ```ini
//! [download]
//! workers = 6
//! min_chunk_size = 4194304
//! read_buffer_size = 32768
//! max_attempts = 3
//! stall_timeout_secs = 30
//! progress_interval_ms = 500
//! download_dir = /home/me/Downloads
//! persist_resume_state = true
//!
//! [proxy]
//! enabled = false
//! host = 127.0.0.1
//! port = 9999
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use tracing::debug;

use crate::error::ConfigError;
use crate::transfer::fetcher::{DEFAULT_READ_BUFFER_SIZE, DEFAULT_STALL_TIMEOUT};
use crate::transfer::planner::DEFAULT_MIN_CHUNK_SIZE;
use crate::transfer::policy::DEFAULT_MAX_ATTEMPTS;
use crate::transfer::RetryPolicy;

/// Default number of concurrent workers per transfer.
pub const DEFAULT_WORKERS: usize = 6;

/// Default connect timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default progress sampling interval (500ms).
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Default capacity of each transfer's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 9999;

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("parafetch/", env!("CARGO_PKG_VERSION"));

const APP_DIR: &str = "parafetch";
const CONFIG_FILE: &str = "config.ini";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Concurrent range requests per transfer.
    pub workers: usize,
    /// Floor on planned chunk size.
    pub min_chunk_size: u64,
    /// Largest single positioned write.
    pub read_buffer_size: usize,
    pub retry: RetryPolicy,
    /// Attempt is abandoned after this long without receiving data.
    pub stall_timeout: Duration,
    pub connect_timeout: Duration,
    pub progress_interval: Duration,
    pub event_capacity: usize,
    /// Save resume records on pause and failure.
    pub persist_resume_state: bool,
    /// Destination directory when a request names no path.
    pub download_dir: PathBuf,
    pub proxy: Option<ProxyConfig>,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            retry: RetryPolicy::exponential(DEFAULT_MAX_ATTEMPTS),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            persist_resume_state: true,
            download_dir: default_download_dir(),
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_min_chunk_size(mut self, size: u64) -> Self {
        self.min_chunk_size = size;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_persist_resume_state(mut self, persist: bool) -> Self {
        self.persist_resume_state = persist;
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.workers == 0, "workers must be at least 1"),
            (self.min_chunk_size == 0, "min_chunk_size must be at least 1"),
            (self.read_buffer_size == 0, "read_buffer_size must be at least 1"),
            (self.retry.max_attempts() == 0, "max_attempts must be at least 1"),
            (self.stall_timeout.is_zero(), "stall_timeout must be non-zero"),
            (self.progress_interval.is_zero(), "progress_interval must be non-zero"),
            (self.event_capacity == 0, "event_capacity must be at least 1"),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid(msg.to_string())),
            None => Ok(()),
        }
    }

    /// Loads an INI file on top of the defaults, then validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = Self::from_ini(&ini)?;
        debug!(path = %path.display(), workers = config.workers, "Loaded configuration");
        Ok(config)
    }

    /// Parses INI text on top of the defaults, then validates.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Loads `path` (or the default location) if it exists, otherwise
    /// returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };
        match path {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("download")) {
            let get = |key| Setting::new(section, "download", key);
            if let Some(v) = get("workers").parse()? {
                config.workers = v;
            }
            if let Some(v) = get("min_chunk_size").parse()? {
                config.min_chunk_size = v;
            }
            if let Some(v) = get("read_buffer_size").parse()? {
                config.read_buffer_size = v;
            }
            if let Some(v) = get("max_attempts").parse()? {
                config.retry = config.retry.with_max_attempts(v);
            }
            if let Some(v) = get("stall_timeout_secs").parse()? {
                config.stall_timeout = Duration::from_secs(v);
            }
            if let Some(v) = get("progress_interval_ms").parse()? {
                config.progress_interval = Duration::from_millis(v);
            }
            if let Some(v) = get("persist_resume_state").parse()? {
                config.persist_resume_state = v;
            }
            if let Some(dir) = get("download_dir").raw().filter(|d| !d.is_empty()) {
                config.download_dir = expand_home(dir);
            }
        }

        if let Some(section) = ini.section(Some("proxy")) {
            let get = |key| Setting::new(section, "proxy", key);
            let enabled = get("enabled").parse()?.unwrap_or(false);
            if enabled {
                let host = get("host").raw().unwrap_or_default().to_string();
                if host.is_empty() {
                    return Err(ConfigError::Invalid(
                        "proxy is enabled but no host is set".to_string(),
                    ));
                }
                let port = get("port").parse()?.unwrap_or(DEFAULT_PROXY_PORT);
                config.proxy = Some(ProxyConfig { host, port });
            }
        }

        config.validate()?;
        Ok(config)
    }
}

/// One key lookup inside an INI section.
struct Setting<'a> {
    section: &'a Properties,
    name: &'static str,
    key: &'static str,
}

impl<'a> Setting<'a> {
    fn new(section: &'a Properties, name: &'static str, key: &'static str) -> Self {
        Self { section, name, key }
    }

    fn raw(&self) -> Option<&'a str> {
        self.section.get(self.key).map(str::trim)
    }

    fn parse<T: FromStr>(&self) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.raw() else {
            return Ok(None);
        };
        value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                section: self.name.to_string(),
                key: self.key.to_string(),
                value: value.to_string(),
            })
    }
}

/// `~/Downloads`, falling back to the working directory.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `<config dir>/parafetch/config.ini`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 6);
        assert_eq!(config.min_chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, 32 * 1024);
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.progress_interval, Duration::from_millis(500));
        assert!(config.persist_resume_state);
        assert!(config.proxy.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_workers(2)
            .with_min_chunk_size(1024)
            .with_download_dir("/tmp/dl")
            .with_persist_resume_state(false);
        assert_eq!(config.workers, 2);
        assert_eq!(config.min_chunk_size, 1024);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/dl"));
        assert!(!config.persist_resume_state);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(EngineConfig::new().with_workers(0).validate().is_err());
        assert!(EngineConfig::new().with_min_chunk_size(0).validate().is_err());
        assert!(EngineConfig::new().with_read_buffer_size(0).validate().is_err());
        assert!(EngineConfig::new()
            .with_retry(RetryPolicy::fixed(0, Duration::ZERO))
            .validate()
            .is_err());
        assert!(EngineConfig::new()
            .with_stall_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_ini_str() {
        let config = EngineConfig::from_ini_str(
            "[download]\n\
             workers = 8\n\
             min_chunk_size = 1048576\n\
             max_attempts = 5\n\
             stall_timeout_secs = 10\n\
             progress_interval_ms = 250\n\
             download_dir = /data/incoming\n\
             persist_resume_state = false\n\
             [proxy]\n\
             enabled = true\n\
             host = 10.0.0.1\n",
        )
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.min_chunk_size, 1_048_576);
        assert_eq!(config.retry.max_attempts(), 5);
        assert_eq!(config.stall_timeout, Duration::from_secs(10));
        assert_eq!(config.progress_interval, Duration::from_millis(250));
        assert_eq!(config.download_dir, PathBuf::from("/data/incoming"));
        assert!(!config.persist_resume_state);
        assert_eq!(
            config.proxy,
            Some(ProxyConfig {
                host: "10.0.0.1".to_string(),
                port: DEFAULT_PROXY_PORT
            })
        );
    }

    #[test]
    fn test_disabled_proxy_is_ignored() {
        let config =
            EngineConfig::from_ini_str("[proxy]\nenabled = false\nhost = 1.2.3.4\n").unwrap();
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_invalid_value() {
        let err = EngineConfig::from_ini_str("[download]\nworkers = many\n").unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                section: "download".to_string(),
                key: "workers".to_string(),
                value: "many".to_string(),
            }
        );
    }

    #[test]
    fn test_zero_workers_in_file_is_invalid() {
        let err = EngineConfig::from_ini_str("[download]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[download]\nworkers = 3\n").unwrap();

        assert_eq!(EngineConfig::load(&path).unwrap().workers, 3);
        assert_eq!(
            EngineConfig::load_or_default(Some(&path)).unwrap().workers,
            3
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::load_or_default(Some(&temp.path().join("absent.ini"))).unwrap();
        assert_eq!(config.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let temp = TempDir::new().unwrap();
        let err = EngineConfig::load(&temp.path().join("absent.ini")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_proxy_url() {
        let proxy = ProxyConfig {
            host: "proxy.local".to_string(),
            port: 3128,
        };
        assert_eq!(proxy.url(), "http://proxy.local:3128");
    }
}
