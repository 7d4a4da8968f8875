//! Schema Registry configuration

use crate::compatibility::CompatibilityLevel;
use crate::error::{SchemaError, SchemaResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a registry node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Node identity, recorded as the producer of appended records
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// URL other nodes use to forward requests to this node
    #[serde(default)]
    pub advertised_url: Option<String>,

    /// Compatibility level when neither subject nor global config is set
    #[serde(default)]
    pub compatibility: CompatibilityLevel,

    /// Commit log settings
    #[serde(default)]
    pub log: LogConfig,

    /// Wait budgets
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Primary election
    #[serde(default)]
    pub leadership: LeadershipConfig,

    /// Let a follower that is still catching up forward ID lookups to the primary
    #[serde(default = "default_true")]
    pub forward_reads_when_not_ready: bool,
}

fn default_node_id() -> String {
    "schemalog-0".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            advertised_url: None,
            compatibility: CompatibilityLevel::default(),
            log: LogConfig::default(),
            timeouts: TimeoutConfig::default(),
            leadership: LeadershipConfig::default(),
            forward_reads_when_not_ready: true,
        }
    }
}

impl RegistryConfig {
    /// Single node on an in-memory log
    pub fn memory() -> Self {
        Self::default()
    }

    /// Set compatibility level
    pub fn with_compatibility(mut self, level: CompatibilityLevel) -> Self {
        self.compatibility = level;
        self
    }

    /// Set node identity and advertised URL
    pub fn with_node(mut self, node_id: impl Into<String>, url: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self.advertised_url = Some(url.into());
        self
    }

    /// Use a file-backed log
    pub fn with_file_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log.backend = LogBackend::File {
            path: path.into(),
            sync_on_append: true,
        };
        self
    }

    pub fn with_leadership(mut self, leadership: LeadershipConfig) -> Self {
        self.leadership = leadership;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_forward_reads(mut self, enabled: bool) -> Self {
        self.forward_reads_when_not_ready = enabled;
        self
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> SchemaResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| SchemaError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> SchemaResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(SchemaError::Config("node_id must not be empty".to_string()));
        }
        if self.log.topic.is_empty() {
            return Err(SchemaError::Config("log topic must not be empty".to_string()));
        }
        if self.log.batch_size == 0 {
            return Err(SchemaError::Config("log batch_size must be positive".to_string()));
        }
        if let LeadershipConfig::Lease { ttl_ms, .. } = self.leadership {
            if ttl_ms < 3 {
                return Err(SchemaError::Config(
                    "lease ttl_ms must be at least 3".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Commit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Topic holding mutation records (default: "_schemas")
    #[serde(default = "default_schema_topic")]
    pub topic: String,

    #[serde(default)]
    pub backend: LogBackend,

    /// Records fetched per read (default: 500)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Long-poll wait when the reader is at the log end (default: 200)
    #[serde(default = "default_poll_wait")]
    pub poll_wait_ms: u64,

    /// First backoff after a failed read (default: 50)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Backoff ceiling (default: 5000)
    #[serde(default = "default_max_retry_backoff")]
    pub max_retry_backoff_ms: u64,
}

fn default_schema_topic() -> String {
    "_schemas".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_poll_wait() -> u64 {
    200
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_max_retry_backoff() -> u64 {
    5000
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            topic: default_schema_topic(),
            backend: LogBackend::default(),
            batch_size: default_batch_size(),
            poll_wait_ms: default_poll_wait(),
            retry_backoff_ms: default_retry_backoff(),
            max_retry_backoff_ms: default_max_retry_backoff(),
        }
    }
}

impl LogConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }
}

/// Where the log lives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogBackend {
    /// In-process log (development and tests)
    #[default]
    Memory,

    /// Single-segment file
    File {
        path: PathBuf,
        #[serde(default = "default_true")]
        sync_on_append: bool,
    },
}

/// Wait budgets in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Reads wait this long for the reader to become ready (default: 30000)
    #[serde(default = "default_ready_timeout")]
    pub ready_ms: u64,

    /// Log append (default: 10000)
    #[serde(default = "default_append_timeout")]
    pub append_ms: u64,

    /// Read-your-writes wait after an append (default: 10000)
    #[serde(default = "default_ack_timeout")]
    pub ack_ms: u64,

    /// Forwarded request round trip (default: 15000)
    #[serde(default = "default_forward_timeout")]
    pub forward_ms: u64,
}

fn default_ready_timeout() -> u64 {
    30000
}

fn default_append_timeout() -> u64 {
    10000
}

fn default_ack_timeout() -> u64 {
    10000
}

fn default_forward_timeout() -> u64 {
    15000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ready_ms: default_ready_timeout(),
            append_ms: default_append_timeout(),
            ack_ms: default_ack_timeout(),
            forward_ms: default_forward_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready_ms)
    }

    pub fn append(&self) -> Duration {
        Duration::from_millis(self.append_ms)
    }

    pub fn ack(&self) -> Duration {
        Duration::from_millis(self.ack_ms)
    }

    pub fn forward(&self) -> Duration {
        Duration::from_millis(self.forward_ms)
    }
}

/// Primary election
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LeadershipConfig {
    /// Fixed role
    Static {
        #[serde(default = "default_true")]
        primary: bool,
        /// Where followers forward writes
        #[serde(default)]
        primary_url: Option<String>,
    },

    /// Lease-based election
    Lease {
        /// Lease lifetime (default: 10000); renewed every third of it
        #[serde(default = "default_lease_ttl")]
        ttl_ms: u64,
        /// Whether this node may hold the lease
        #[serde(default = "default_true")]
        eligible: bool,
    },
}

fn default_lease_ttl() -> u64 {
    10000
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        LeadershipConfig::Static {
            primary: true,
            primary_url: None,
        }
    }
}

impl LeadershipConfig {
    /// Follower of a fixed primary
    pub fn follower(primary_url: impl Into<String>) -> Self {
        LeadershipConfig::Static {
            primary: false,
            primary_url: Some(primary_url.into()),
        }
    }

    pub fn lease(ttl: Duration, eligible: bool) -> Self {
        LeadershipConfig::Lease {
            ttl_ms: ttl.as_millis() as u64,
            eligible,
        }
    }
}
