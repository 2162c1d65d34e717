// crates/trimatrix-daemon/src/config.rs
//
// Runtime configuration for the Trimatrix node daemon.
// Loaded from a TOML file or populated with sensible defaults.

use serde::Deserialize;
use std::fs;

use trimatrix_core::{MatrixConfig, DEFAULT_MAX_PEERS};

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Directory for local data storage (RocksDB).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Address the peer listener binds to. Port 0 picks an ephemeral port.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Publicly reachable address announced to peers. When unset, the bound
    /// listener address is announced instead.
    #[serde(default)]
    pub advertised_addr: Option<String>,

    /// Bootstrap peer addresses dialed at startup (e.g. ["10.0.0.2:7411"]).
    /// When empty (default), the node starts isolated.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Spatial extent of the matrix per axis.
    #[serde(default = "default_dimensions")]
    pub dimensions: u32,

    /// Neighborhood radius used during consensus scoring.
    #[serde(default = "default_complexity")]
    pub complexity: u32,

    /// Consensus score at or above which a triad becomes validated.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,

    /// Connection cap, inbound and outbound combined.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> String {
    "./trimatrix-data".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:7411".to_string()
}

fn default_dimensions() -> u32 {
    trimatrix_core::DEFAULT_DIMENSIONS
}

fn default_complexity() -> u32 {
    trimatrix_core::DEFAULT_COMPLEXITY
}

fn default_consensus_threshold() -> f64 {
    trimatrix_core::DEFAULT_CONSENSUS_THRESHOLD
}

fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen_addr: default_listen_addr(),
            advertised_addr: None,
            peers: Vec::new(),
            dimensions: default_dimensions(),
            complexity: default_complexity(),
            consensus_threshold: default_consensus_threshold(),
            max_peers: default_max_peers(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file at the given path.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Matrix parameters as the store expects them. Out-of-range values are
    /// replaced with defaults by the store on open.
    pub fn matrix_config(&self) -> MatrixConfig {
        MatrixConfig {
            dimensions: self.dimensions,
            complexity: self.complexity,
            consensus_threshold: self.consensus_threshold,
        }
    }

    /// Peer cap with a zero value replaced by the default.
    pub fn effective_max_peers(&self) -> usize {
        if self.max_peers == 0 {
            tracing::warn!(
                "max_peers = 0 would isolate the node, using default {}",
                DEFAULT_MAX_PEERS
            );
            DEFAULT_MAX_PEERS
        } else {
            self.max_peers
        }
    }
}
