use anyhow::{bail, ensure, Context, Result};
use fleet_core::FleetConfig;
use serde::Deserialize;
use shared::types::{NodeId, NodeInfo, TaskType};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// One node's TOML configuration. The `[node]` and `[fleet]` sections
/// are required; everything else falls back to the deployed defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub fleet: FleetSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub queue: QueueSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    pub id: NodeId,
    pub location: String,
    /// Address the API server binds, e.g. "0.0.0.0:3000".
    pub bind_addr: String,
    /// URL peers use to reach this node.
    pub advertise_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetSection {
    pub supervisor: NodeId,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    pub id: NodeId,
    pub url: String,
    pub location: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub heartbeat_ms: u64,
    pub suspect_after: u32,
    pub dead_after: u32,
    pub load_sample_ms: u64,
    pub load_ema_weight: f64,
    pub load_max_stale: u32,
    pub offload_threshold: u8,
    pub election_window_ms: u64,
    pub election_backoff_min_ms: u64,
    pub election_backoff_max_ms: u64,
    pub election_max_rounds: u32,
    pub dispatch_ms: u64,
    pub announce_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            heartbeat_ms: 1000,
            suspect_after: 3,
            dead_after: 8,
            load_sample_ms: 5000,
            load_ema_weight: 0.3,
            load_max_stale: 3,
            offload_threshold: 70,
            election_window_ms: 500,
            election_backoff_min_ms: 200,
            election_backoff_max_ms: 800,
            election_max_rounds: 5,
            dispatch_ms: 100,
            announce_ms: 2000,
            request_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub concurrency: usize,
    pub max_retries: u32,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// Local stub that echoes the prompt. No network, no keys.
    Echo,
    /// OpenAI-compatible chat completions endpoint.
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub mode: ProviderMode,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key. The key
    /// itself never lives in the config file.
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    /// Task-type to model overrides, e.g. `reasoning = "gpt-4-turbo"`.
    pub models: HashMap<String, String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Echo,
            base_url: None,
            api_key_env: None,
            timeout_ms: 30_000,
            models: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 1000,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub capacity: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.node.id.is_empty(), "node.id must not be empty");
        ensure!(
            self.fleet.peers.iter().all(|p| p.id != self.node.id),
            "fleet.peers must not include the node itself"
        );
        ensure!(
            self.timing.load_ema_weight > 0.0 && self.timing.load_ema_weight <= 1.0,
            "timing.load_ema_weight must be in (0, 1]"
        );
        ensure!(
            self.timing.suspect_after < self.timing.dead_after,
            "timing.suspect_after must be below timing.dead_after"
        );
        ensure!(
            self.timing.election_backoff_min_ms <= self.timing.election_backoff_max_ms,
            "timing.election_backoff_min_ms must not exceed the max"
        );
        if self.provider.mode == ProviderMode::Http {
            ensure!(
                self.provider.base_url.is_some(),
                "provider.base_url is required when provider.mode is http"
            );
        }
        Ok(())
    }

    pub fn self_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.node.id.clone(),
            url: self.node.advertise_url.clone(),
            location: self.node.location.clone(),
        }
    }

    pub fn peer_infos(&self) -> Vec<NodeInfo> {
        self.fleet
            .peers
            .iter()
            .map(|p| NodeInfo {
                id: p.id.clone(),
                url: p.url.clone(),
                location: p.location.clone(),
            })
            .collect()
    }

    pub fn peer_urls(&self) -> HashMap<NodeId, String> {
        self.fleet
            .peers
            .iter()
            .map(|p| (p.id.clone(), p.url.clone()))
            .collect()
    }

    pub fn model_overrides(&self) -> Result<HashMap<TaskType, String>> {
        let mut overrides = HashMap::new();
        for (name, model) in &self.provider.models {
            let Some(task_type) = TaskType::ALL.iter().find(|t| t.as_str() == name) else {
                bail!("provider.models has unknown task type {name:?}");
            };
            overrides.insert(*task_type, model.clone());
        }
        Ok(overrides)
    }

    pub fn fleet_config(&self) -> FleetConfig {
        let t = &self.timing;
        FleetConfig {
            heartbeat_interval: Duration::from_millis(t.heartbeat_ms),
            suspect_after: t.suspect_after,
            dead_after: t.dead_after,
            load_sample_interval: Duration::from_millis(t.load_sample_ms),
            load_ema_weight: t.load_ema_weight,
            load_max_stale: t.load_max_stale,
            offload_threshold: t.offload_threshold,
            election_window: Duration::from_millis(t.election_window_ms),
            election_backoff_min: Duration::from_millis(t.election_backoff_min_ms),
            election_backoff_max: Duration::from_millis(t.election_backoff_max_ms),
            election_max_rounds: t.election_max_rounds,
            dispatch_interval: Duration::from_millis(t.dispatch_ms),
            announce_interval: Duration::from_millis(t.announce_ms),
            queue_capacity: self.queue.capacity,
            sensor_poll_interval: Duration::from_millis(self.sensor.poll_interval_ms),
            sensor_backoff_base: Duration::from_millis(self.sensor.backoff_base_ms),
            sensor_backoff_cap: Duration::from_millis(self.sensor.backoff_cap_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.request_timeout_ms)
    }
}
