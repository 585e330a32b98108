//! Configuration management.
//!
//! A `figment`-based `Config` (YAML file + `ROUTEFORGE_`-prefixed env
//! overrides), `#[serde(default)]` throughout, `Duration` fields via
//! `humantime_serde`. Carries exactly the knobs spec §6 names: server
//! bind/timeout, [`RouteManagerConfig`], [`QueueFabricConfig`], and
//! [`HookConfig`].

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration loaded from an optional YAML file plus
/// `ROUTEFORGE_`-prefixed environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server bind address/port and request ceiling.
    pub server: ServerConfig,
    /// Route Manager knobs (spec §4.D / §6).
    pub route_manager: RouteManagerConfig,
    /// Queue Fabric knobs (spec §4.E / §6).
    pub queue_fabric: QueueFabricConfig,
    /// Hook Orchestrator knobs (spec §4.F / §6).
    pub hooks: HookConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            route_manager: RouteManagerConfig::default(),
            queue_fabric: QueueFabricConfig::default(),
            hooks: HookConfig::default(),
        }
    }
}

/// HTTP bind address and the request-ceiling (spec §5, default 30s).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Request timeout ceiling; a request running longer is cancelled
    /// with an HTTP 408-equivalent.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Route Manager configuration knobs (spec §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteManagerConfig {
    /// Per-map cache capacity (manifest/gtype/health caches).
    pub max_cache_size: usize,
    /// Health scan tick.
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Rate-limit sweep tick.
    #[serde(with = "humantime_serde")]
    pub rate_limit_cleanup_interval: Duration,
}

impl Default for RouteManagerConfig {
    fn default() -> Self {
        let core = routeforge_core::RouteManagerConfig::default();
        Self {
            max_cache_size: core.max_cache_size,
            health_check_interval: core.health_check_interval,
            rate_limit_cleanup_interval: core.rate_limit_cleanup_interval,
        }
    }
}

impl From<RouteManagerConfig> for routeforge_core::RouteManagerConfig {
    fn from(cfg: RouteManagerConfig) -> Self {
        Self {
            max_cache_size: cfg.max_cache_size,
            health_check_interval: cfg.health_check_interval,
            rate_limit_cleanup_interval: cfg.rate_limit_cleanup_interval,
        }
    }
}

/// Delivery semantics the config layer can name (spec §6
/// `defaultDeliverySemantics`), mapped onto the core enum at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliverySemanticsConfig {
    /// May redeliver on retry.
    AtLeastOnce,
    /// Suppresses replays via the delivered-id set.
    ExactlyOnce,
}

impl From<DeliverySemanticsConfig> for routeforge_core::DeliverySemantics {
    fn from(value: DeliverySemanticsConfig) -> Self {
        match value {
            DeliverySemanticsConfig::AtLeastOnce => Self::AtLeastOnce,
            DeliverySemanticsConfig::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

/// Queue Fabric configuration knobs (spec §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueFabricConfig {
    /// Max queue depth before `publish` rejects with `Backpressure`.
    pub max_queue_depth: usize,
    /// Default delivery semantics applied when a publish omits one.
    pub default_delivery_semantics: DeliverySemanticsConfig,
    /// Delivery attempts before a message is dropped.
    pub max_delivery_attempts: u32,
    /// TTL applied when a publish omits one.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
}

impl Default for QueueFabricConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: routeforge_core::queue_fabric::DEFAULT_MAX_QUEUE_DEPTH,
            default_delivery_semantics: DeliverySemanticsConfig::AtLeastOnce,
            max_delivery_attempts: routeforge_core::queue_fabric::DEFAULT_MAX_DELIVERY_ATTEMPTS,
            default_ttl: routeforge_core::queue_fabric::DEFAULT_TTL,
        }
    }
}

/// Hook Orchestrator configuration knobs (spec §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Default per-hook timeout.
    #[serde(with = "humantime_serde")]
    pub default_hook_timeout: Duration,
    /// Default retry count.
    pub default_retries: u32,
    /// Whether lifecycle events are emitted to the configured sink.
    pub emit_events: bool,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            default_hook_timeout: routeforge_core::hooks::DEFAULT_HOOK_TIMEOUT,
            default_retries: routeforge_core::hooks::DEFAULT_RETRIES,
            emit_events: true,
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file merged over defaults,
    /// then env overrides prefixed `ROUTEFORGE_` (e.g. `ROUTEFORGE_SERVER.PORT`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be parsed or a value
    /// fails to deserialize into the expected shape.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("ROUTEFORGE_").split("__"));
        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_figment() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.route_manager.max_cache_size, 1000);
    }

    #[test]
    fn env_override_applies_prefixed_split_path() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("ROUTEFORGE_SERVER__PORT", "9090");
            let config = Config::load(None).unwrap();
            assert_eq!(config.server.port, 9090);
            Ok(())
        });
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server:\n  port: 4000\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 4000);
    }
}
