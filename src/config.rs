use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Overrides the `wgroutemgr.network` label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub proc_root: PathBuf,
    pub ip_command: String,
    pub event_buffer: usize,
    pub namespace_timeout_ms: u64,
    pub resync_backoff_min_ms: u64,
    pub resync_backoff_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: None,
            proc_root: PathBuf::from("/proc"),
            ip_command: "ip".into(),
            event_buffer: 128,
            namespace_timeout_ms: 10_000,
            resync_backoff_min_ms: 500,
            resync_backoff_max_ms: 30_000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("wgroutemgr.toml"))
                .merge(Json::file("wgroutemgr.json"))
                .merge(Env::prefixed("WGROUTEMGR_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.event_buffer == 0 {
            anyhow::bail!("event_buffer must be greater than zero");
        }
        if config.resync_backoff_min_ms == 0
            || config.resync_backoff_min_ms > config.resync_backoff_max_ms
        {
            anyhow::bail!(
                "Invalid resync backoff: min {}ms, max {}ms",
                config.resync_backoff_min_ms,
                config.resync_backoff_max_ms
            );
        }

        // An empty override behaves like no override.
        let network = config.network.filter(|n| !n.trim().is_empty());
        Ok(Config { network, ..config })
    }

    pub fn namespace_timeout(&self) -> Duration {
        Duration::from_millis(self.namespace_timeout_ms)
    }

    pub fn resync_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.resync_backoff_min_ms),
            Duration::from_millis(self.resync_backoff_max_ms),
        )
    }
}
