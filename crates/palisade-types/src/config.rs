//! Agent configuration snapshot.
//!
//! The full configuration file is parsed elsewhere (YAML with shared group
//! overlays); this module only models the keys the comms core consumes,
//! with documented defaults and range validation. Out-of-range values fall
//! back to the default with a warning rather than failing startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::PalisadeError;

/// Default manager host.
const DEFAULT_MANAGER_IP: &str = "localhost";

/// Default manager comms API port.
const DEFAULT_COMMS_PORT: &str = "27000";

/// Default upper bound on a drained batch payload, in bytes.
const DEFAULT_MAX_BATCHING_SIZE: usize = 1_000_000;

/// Smallest accepted batching size. Below this the default is used.
const MIN_BATCHING_SIZE: usize = 1000;

/// Default minimum wall time between successive requests per pipeline.
const DEFAULT_BATCH_INTERVAL_MS: u64 = 10_000;

/// Default sleep between failed connection attempts.
const DEFAULT_CONNECTION_RETRY_SECS: u64 = 30;

/// The `agent:` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Target host for all manager requests.
    pub manager_ip: String,
    /// Target port (kept as a string; it is only ever spliced into URLs).
    pub agent_comms_api_port: String,
    /// Upper bound on a drained batch payload, in bytes.
    pub max_batching_size: usize,
    /// Minimum wall time between successive requests on each pipeline (ms).
    pub batch_interval_ms: u64,
    /// Sleep between failed connect attempts (seconds).
    pub connection_retry_secs: u64,
    /// Whether to talk TLS to the manager.
    pub use_https: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            manager_ip: DEFAULT_MANAGER_IP.to_string(),
            agent_comms_api_port: DEFAULT_COMMS_PORT.to_string(),
            max_batching_size: DEFAULT_MAX_BATCHING_SIZE,
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            connection_retry_secs: DEFAULT_CONNECTION_RETRY_SECS,
            use_https: false,
        }
    }
}

/// Top-level configuration file shape: everything the core reads lives
/// under the `agent:` key.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    agent: AgentConfig,
}

impl AgentConfig {
    /// Load the `agent:` section from a YAML file.
    ///
    /// A missing file is an error; a file without an `agent:` section
    /// yields defaults.
    pub fn load(path: &Path) -> Result<Self, PalisadeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PalisadeError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let file: ConfigFile = serde_yaml::from_str(&raw).map_err(|e| {
            PalisadeError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(file.agent.validated())
    }

    /// Clamp out-of-range values back to their documented defaults.
    pub fn validated(mut self) -> Self {
        if self.max_batching_size < MIN_BATCHING_SIZE {
            warn!(
                configured = self.max_batching_size,
                fallback = DEFAULT_MAX_BATCHING_SIZE,
                "max_batching_size below minimum, using default"
            );
            self.max_batching_size = DEFAULT_MAX_BATCHING_SIZE;
        }
        if self.batch_interval_ms == 0 {
            warn!(
                fallback = DEFAULT_BATCH_INTERVAL_MS,
                "batch_interval_ms is zero, using default"
            );
            self.batch_interval_ms = DEFAULT_BATCH_INTERVAL_MS;
        }
        if self.connection_retry_secs == 0 {
            warn!(
                fallback = DEFAULT_CONNECTION_RETRY_SECS,
                "connection_retry_secs is zero, using default"
            );
            self.connection_retry_secs = DEFAULT_CONNECTION_RETRY_SECS;
        }
        self
    }

    /// The batching interval as a `Duration`.
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// The connection retry sleep as a `Duration`.
    ///
    /// This is the single place `connection_retry_secs` is converted;
    /// everything downstream works in `Duration` and never rescales.
    pub fn connection_retry(&self) -> Duration {
        Duration::from_secs(self.connection_retry_secs)
    }
}
