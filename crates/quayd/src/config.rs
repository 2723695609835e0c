//! TOML configuration for the Quay daemon.
//!
//! Every section is optional. Tuning knobs are `Option`s resolved by the
//! accessor methods on [`CliConfig`], which carry the defaults.
//! [`CliConfig::orchestrator`] rejects combinations the daemon cannot run
//! with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::ensure;
use quay_engine::OrchestratorConfig;
use quay_types::{ProbeConfig, QueueConfig, ShuttleConfig, StagingConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity.
    pub node: NodeSection,
    /// Deployment secret and known peers.
    pub cluster: ClusterSection,
    /// Peer probing.
    pub probe: ProbeSection,
    /// Staging zone thresholds.
    pub staging: StagingSection,
    /// Check queue.
    pub queue: QueueSection,
    /// Shuttle liveness and channel sizes.
    pub shuttle: ShuttleSection,
    /// Deduplication registries.
    pub registry: RegistrySection,
    /// Deal making.
    pub deal: DealSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory holding the persistent node key.
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".quay"))
            .unwrap_or_else(|| PathBuf::from(".quay"));
        Self { data_dir }
    }
}

/// `[cluster]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Shared secret; shuttles must be configured with the same one.
    ///
    /// If empty, a random secret is generated at startup and displayed.
    pub secret: String,
    /// Peers seeded into the address book (`"id"` or `"id@host:port"`).
    pub peers: Vec<String>,
}

/// `[probe]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    /// Per-peer ping timeout in milliseconds.
    pub per_peer_timeout_ms: Option<u64>,
    /// Whole-round timeout in milliseconds.
    pub round_timeout_ms: Option<u64>,
    /// Maximum concurrent pings.
    pub concurrency: Option<usize>,
    /// Lifetime of a probed peer's address in seconds.
    pub addr_ttl_secs: Option<u64>,
}

/// `[staging]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StagingSection {
    /// Size in bytes at which a zone is ready for a deal.
    pub min_size: Option<u64>,
    /// Hard cap on a zone's size in bytes.
    pub max_size: Option<u64>,
    /// Item count at which a zone is full.
    pub max_items: Option<usize>,
    /// Age in seconds after which a zone is sealed regardless.
    pub max_lifetime_secs: Option<u64>,
    /// Sealed zones remembered per group.
    pub max_sealed_history: Option<usize>,
    /// Sealer pass interval in seconds.
    pub seal_interval_secs: Option<u64>,
}

/// `[queue]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Work channel capacity.
    pub capacity: Option<usize>,
    /// Retry delay in milliseconds for checks that hit a full channel.
    pub retry_delay_ms: Option<u64>,
}

/// `[shuttle]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ShuttleSection {
    /// Seconds without a message before a shuttle is no longer live.
    pub liveness_timeout_secs: Option<u64>,
    /// Per-shuttle outbound command channel capacity.
    pub outbound_capacity: Option<usize>,
    /// Shared inbound RPC channel capacity.
    pub ingress_capacity: Option<usize>,
}

/// `[registry]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Transfer statuses kept in the cache. `0` disables caching.
    pub transfer_cache_capacity: Option<usize>,
}

/// `[deal]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DealSection {
    /// Start with deal making disabled.
    pub disabled: bool,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective probe parameters.
    pub fn probe(&self) -> ProbeConfig {
        let d = ProbeConfig::default();
        ProbeConfig {
            per_peer_timeout: self
                .probe
                .per_peer_timeout_ms
                .map_or(d.per_peer_timeout, Duration::from_millis),
            round_timeout: self
                .probe
                .round_timeout_ms
                .map_or(d.round_timeout, Duration::from_millis),
            concurrency: self.probe.concurrency.unwrap_or(d.concurrency),
            addr_ttl: self
                .probe
                .addr_ttl_secs
                .map_or(d.addr_ttl, Duration::from_secs),
        }
    }

    /// Effective staging thresholds.
    pub fn staging(&self) -> StagingConfig {
        let d = StagingConfig::default();
        let s = &self.staging;
        StagingConfig {
            min_size: s.min_size.unwrap_or(d.min_size),
            max_size: s.max_size.unwrap_or(d.max_size),
            max_items: s.max_items.unwrap_or(d.max_items),
            max_lifetime: s
                .max_lifetime_secs
                .map_or(d.max_lifetime, Duration::from_secs),
            max_sealed_history: s.max_sealed_history.unwrap_or(d.max_sealed_history),
            seal_interval: s
                .seal_interval_secs
                .map_or(d.seal_interval, Duration::from_secs),
        }
    }

    /// Effective check queue parameters.
    pub fn queue(&self) -> QueueConfig {
        let d = QueueConfig::default();
        QueueConfig {
            capacity: self.queue.capacity.unwrap_or(d.capacity),
            retry_delay: self
                .queue
                .retry_delay_ms
                .map_or(d.retry_delay, Duration::from_millis),
        }
    }

    /// Effective shuttle parameters.
    pub fn shuttle(&self) -> ShuttleConfig {
        let d = ShuttleConfig::default();
        ShuttleConfig {
            liveness_timeout: self
                .shuttle
                .liveness_timeout_secs
                .map_or(d.liveness_timeout, Duration::from_secs),
            outbound_capacity: self.shuttle.outbound_capacity.unwrap_or(d.outbound_capacity),
            ingress_capacity: self.shuttle.ingress_capacity.unwrap_or(d.ingress_capacity),
        }
    }

    /// Number of transfer statuses cached.
    pub fn transfer_cache_capacity(&self) -> usize {
        self.registry
            .transfer_cache_capacity
            .unwrap_or(OrchestratorConfig::default().transfer_cache_capacity)
    }

    /// Assemble and validate the orchestrator configuration.
    pub fn orchestrator(&self) -> anyhow::Result<OrchestratorConfig> {
        let config = OrchestratorConfig {
            probe: self.probe(),
            staging: self.staging(),
            queue: self.queue(),
            shuttle: self.shuttle(),
            transfer_cache_capacity: self.transfer_cache_capacity(),
            deal_making_disabled: self.deal.disabled,
        };

        let staging = &config.staging;
        ensure!(
            !staging.seal_interval.is_zero(),
            "staging.seal_interval_secs must be greater than zero"
        );
        ensure!(
            staging.min_size <= staging.max_size,
            "staging.min_size ({}) must not exceed staging.max_size ({})",
            staging.min_size,
            staging.max_size
        );
        ensure!(
            staging.max_items > 0,
            "staging.max_items must be greater than zero"
        );
        ensure!(
            !config.shuttle.liveness_timeout.is_zero(),
            "shuttle.liveness_timeout_secs must be greater than zero"
        );
        ensure!(
            !config.probe.per_peer_timeout.is_zero(),
            "probe.per_peer_timeout_ms must be greater than zero"
        );
        ensure!(
            !config.probe.round_timeout.is_zero(),
            "probe.round_timeout_ms must be greater than zero"
        );
        ensure!(
            config.queue.capacity > 0,
            "queue.capacity must be greater than zero"
        );
        Ok(config)
    }
}
