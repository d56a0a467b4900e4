//! Gateway configuration
//!
//! Settings come from three layers, later layers winning:
//! 1. compiled-in defaults,
//! 2. the TOML seed file (shuttle inventory, stock mapping, WMS endpoint),
//! 3. environment variables for every network tunable.
//!
//! The stock→shuttle mapping is held behind an `ArcSwap` so the admin API
//! can remap a shuttle at runtime without locking readers; every mutation
//! is written back to the seed file.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid seed file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unknown shuttle: {0}")]
    UnknownShuttle(String),
    #[error("unknown stock: {0}")]
    UnknownStock(String),
}

/// Network endpoint of a configured shuttle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShuttleEndpoint {
    pub host: String,
    /// Port the shuttle listens on for gateway commands.
    #[serde(default = "default_command_port")]
    pub command_port: u16,
}

fn default_command_port() -> u16 {
    2000
}

/// WMS REST API connection settings (polling integration).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WmsSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Seconds between poll cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    30
}

/// On-disk seed: shuttle inventory + stock mapping + integration endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SeedFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    listener_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    shuttles: HashMap<String, ShuttleEndpoint>,
    #[serde(default)]
    stocks: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wms: Option<WmsSettings>,
}

/// Resolved gateway settings, shared as `Arc<Settings>`.
pub struct Settings {
    /// Port the inbound shuttle listener binds to.
    pub listener_port: u16,
    /// Bind address of the admin HTTP API.
    pub api_addr: String,
    pub tcp_connect_timeout: Duration,
    pub tcp_read_timeout: Duration,
    pub tcp_write_timeout: Duration,
    /// Inbound silence budget before a connection is declared dead.
    pub shuttle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub command_queue_max_size: usize,
    pub command_processor_workers: usize,
    /// Battery percentage below which BATTERY_LOW fires.
    pub low_battery_threshold: f64,
    /// WMS webhook endpoint; `None` disables reporting.
    pub webhook_url: Option<String>,
    /// WMS polling integration; `None` disables the poller.
    pub wms: Option<WmsSettings>,
    /// Directory for the sled state store.
    pub data_dir: PathBuf,
    /// Shuttle inventory, immutable after boot.
    pub shuttles: HashMap<String, ShuttleEndpoint>,
    /// Stock name → ordered list of eligible shuttle ids.
    stocks: ArcSwap<HashMap<String, Vec<String>>>,
    /// Seed file to persist runtime stock mutations into.
    seed_path: Option<PathBuf>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("listener_port", &self.listener_port)
            .field("api_addr", &self.api_addr)
            .field("shuttles", &self.shuttles.keys().collect::<Vec<_>>())
            .field("stocks", &self.stocks.load())
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Load settings from an optional seed file, then apply env overrides.
    pub fn load(seed_path: Option<&Path>) -> Result<Self, ConfigError> {
        let seed = match seed_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str::<SeedFile>(&raw).map_err(|e| ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?
            }
            None => SeedFile::default(),
        };

        if seed.shuttles.is_empty() {
            warn!("No shuttles configured — the gateway will accept no work");
        }

        let settings = Self {
            listener_port: env_parse("SHUTTLE_LISTENER_PORT", seed.listener_port.unwrap_or(5000)),
            api_addr: std::env::var("GATEWAY_API_ADDR")
                .ok()
                .or(seed.api_addr)
                .unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            tcp_connect_timeout: env_secs("TCP_CONNECT_TIMEOUT", 5.0),
            tcp_read_timeout: env_secs("TCP_READ_TIMEOUT", 20.0),
            tcp_write_timeout: env_secs("TCP_WRITE_TIMEOUT", 5.0),
            shuttle_timeout: env_secs("SHUTTLE_TIMEOUT_SECONDS", 30.0),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECONDS", 30.0),
            command_queue_max_size: env_parse("COMMAND_QUEUE_MAX_SIZE", 1000),
            command_processor_workers: env_parse("COMMAND_PROCESSOR_WORKERS", 1),
            low_battery_threshold: env_parse("LOW_BATTERY_THRESHOLD", 20.0),
            webhook_url: std::env::var("WMS_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .or(seed.webhook_url),
            wms: seed.wms,
            data_dir: seed.data_dir.unwrap_or_else(|| PathBuf::from("./data")),
            shuttles: seed.shuttles,
            stocks: ArcSwap::from_pointee(seed.stocks),
            seed_path: seed_path.map(Path::to_path_buf),
        };

        info!(
            shuttles = settings.shuttles.len(),
            listener_port = settings.listener_port,
            webhook = settings.webhook_url.is_some(),
            wms_poller = settings.wms.is_some(),
            "Gateway configuration loaded"
        );

        Ok(settings)
    }

    /// Minimal settings for tests and embedded use.
    pub fn with_shuttles(shuttles: HashMap<String, ShuttleEndpoint>) -> Self {
        Self {
            listener_port: 0,
            api_addr: "127.0.0.1:0".to_string(),
            tcp_connect_timeout: Duration::from_secs(5),
            tcp_read_timeout: Duration::from_secs(20),
            tcp_write_timeout: Duration::from_secs(5),
            shuttle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            command_queue_max_size: 1000,
            command_processor_workers: 1,
            low_battery_threshold: 20.0,
            webhook_url: None,
            wms: None,
            data_dir: PathBuf::from("./data"),
            shuttles,
            stocks: ArcSwap::from_pointee(HashMap::new()),
            seed_path: None,
        }
    }

    /// Endpoint for a configured shuttle.
    pub fn endpoint(&self, shuttle_id: &str) -> Option<&ShuttleEndpoint> {
        self.shuttles.get(shuttle_id)
    }

    /// Resolve a shuttle id from a peer IP on the inbound listener.
    pub fn shuttle_by_host(&self, host: &str) -> Option<&str> {
        self.shuttles
            .iter()
            .find(|(_, ep)| ep.host == host)
            .map(|(id, _)| id.as_str())
    }

    /// Current stock→shuttle mapping snapshot.
    pub fn stocks(&self) -> Arc<HashMap<String, Vec<String>>> {
        self.stocks.load_full()
    }

    /// Ordered shuttle ids eligible for a stock.
    pub fn eligible_shuttles(&self, stock: &str) -> Vec<String> {
        self.stocks
            .load()
            .get(stock)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the initial stock mapping (boot-time seeding helper).
    pub fn seed_stocks(&self, stocks: HashMap<String, Vec<String>>) {
        self.stocks.store(Arc::new(stocks));
    }

    /// Move a shuttle to a stock, removing it from all others, and persist
    /// the seed file when one was configured.
    pub fn move_shuttle(&self, shuttle_id: &str, to_stock: &str) -> Result<(), ConfigError> {
        if !self.shuttles.contains_key(shuttle_id) {
            return Err(ConfigError::UnknownShuttle(shuttle_id.to_string()));
        }

        self.stocks.rcu(|current| {
            let mut next: HashMap<String, Vec<String>> = (**current).clone();
            for members in next.values_mut() {
                members.retain(|id| id != shuttle_id);
            }
            next.entry(to_stock.to_string())
                .or_default()
                .push(shuttle_id.to_string());
            next
        });

        info!(shuttle_id, stock = to_stock, "Shuttle remapped to stock");
        self.persist_seed()
    }

    /// Write the current inventory + mapping back to the seed file.
    fn persist_seed(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.seed_path else {
            return Ok(());
        };

        let seed = SeedFile {
            listener_port: Some(self.listener_port),
            api_addr: Some(self.api_addr.clone()),
            webhook_url: self.webhook_url.clone(),
            data_dir: Some(self.data_dir.clone()),
            shuttles: self.shuttles.clone(),
            stocks: (*self.stocks.load_full()).clone(),
            wms: self.wms.clone(),
        };

        let raw = toml::to_string_pretty(&seed).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(path, raw).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "Seed configuration rewritten");
        Ok(())
    }
}

/// Parse an environment variable, falling back to a default.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse an environment variable holding seconds (fractional allowed).
fn env_secs(key: &str, default: f64) -> Duration {
    Duration::from_secs_f64(env_parse(key, default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_shuttles() -> HashMap<String, ShuttleEndpoint> {
        let mut map = HashMap::new();
        map.insert(
            "shuttle_1".to_string(),
            ShuttleEndpoint {
                host: "10.10.10.11".to_string(),
                command_port: 2000,
            },
        );
        map.insert(
            "shuttle_2".to_string(),
            ShuttleEndpoint {
                host: "10.10.10.12".to_string(),
                command_port: 2001,
            },
        );
        map
    }

    #[test]
    fn test_seed_file_parse() {
        let raw = r#"
            listener_port = 5001

            [shuttles.shuttle_1]
            host = "10.10.10.11"

            [shuttles.shuttle_2]
            host = "10.10.10.12"
            command_port = 2001

            [stocks]
            main = ["shuttle_1", "shuttle_2"]
            overflow = ["shuttle_2"]
        "#;
        let seed: SeedFile = toml::from_str(raw).unwrap();
        assert_eq!(seed.listener_port, Some(5001));
        // command_port defaults to 2000 when omitted
        assert_eq!(seed.shuttles["shuttle_1"].command_port, 2000);
        assert_eq!(seed.shuttles["shuttle_2"].command_port, 2001);
        assert_eq!(seed.stocks["main"], vec!["shuttle_1", "shuttle_2"]);
    }

    #[test]
    fn test_shuttle_by_host() {
        let settings = Settings::with_shuttles(two_shuttles());
        assert_eq!(settings.shuttle_by_host("10.10.10.11"), Some("shuttle_1"));
        assert_eq!(settings.shuttle_by_host("192.168.0.1"), None);
    }

    #[test]
    fn test_move_shuttle_updates_mapping() {
        let settings = Settings::with_shuttles(two_shuttles());
        let mut stocks = HashMap::new();
        stocks.insert(
            "main".to_string(),
            vec!["shuttle_1".to_string(), "shuttle_2".to_string()],
        );
        settings.seed_stocks(stocks);

        settings.move_shuttle("shuttle_1", "overflow").unwrap();

        assert_eq!(settings.eligible_shuttles("main"), vec!["shuttle_2"]);
        assert_eq!(settings.eligible_shuttles("overflow"), vec!["shuttle_1"]);
    }

    #[test]
    fn test_move_unknown_shuttle_rejected() {
        let settings = Settings::with_shuttles(two_shuttles());
        assert!(matches!(
            settings.move_shuttle("ghost", "main"),
            Err(ConfigError::UnknownShuttle(_))
        ));
    }

    #[test]
    fn test_move_shuttle_persists_seed() {
        let tmp = tempfile::tempdir().unwrap();
        let seed_path = tmp.path().join("gateway.toml");
        std::fs::write(
            &seed_path,
            r#"
                [shuttles.shuttle_1]
                host = "127.0.0.1"

                [stocks]
                main = ["shuttle_1"]
            "#,
        )
        .unwrap();

        let settings = Settings::load(Some(seed_path.as_path())).unwrap();
        settings.move_shuttle("shuttle_1", "overflow").unwrap();

        let reloaded = Settings::load(Some(seed_path.as_path())).unwrap();
        assert!(reloaded.eligible_shuttles("main").is_empty());
        assert_eq!(reloaded.eligible_shuttles("overflow"), vec!["shuttle_1"]);
    }
}
