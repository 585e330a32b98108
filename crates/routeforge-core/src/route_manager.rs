//! Component D — Route Manager (spec §4.D), the central orchestrator.
//!
//! Coordinates the Version Registry, Transformer Engine, and Manifest Store
//! plus handler instances, health, rate limits, and auth. Grounded on the
//! reference gateway's `failsafe/health.rs` three-state consecutive-failure
//! machine for [`HealthStatus`] transitions, and on `failsafe/rate_limiter.rs`'s
//! lazy-init-behind-a-lock shape for the rate-limit state — though the
//! algorithm itself is a fixed-window counter per spec §4.D step 4, not
//! `rate_limiter.rs`'s token bucket (see the crate's design notes for why
//! that dependency was dropped rather than reused).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::BoundedCache;
use crate::context::{AuthContext, GlobalContext, LocalContext};
use crate::error::{Result, RoutingError, RoutingErrorCode};
use crate::manifest_store::{HandlerManifest, ManifestStore};
use crate::transformer::TransformerEngine;
use crate::tsv::Tsv;
use crate::version_registry::{VersionRegistry, VersionStatus};

/// Default per-map cache capacity (spec §4.D).
pub const DEFAULT_CACHE_SIZE: usize = 1000;
/// How long an instance may go unaccessed before the health scan degrades it.
pub const HEALTH_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Health scan tick.
pub const HEALTH_SCAN_INTERVAL: Duration = Duration::from_secs(30);
/// Rate-limit sweep tick.
pub const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Cap applied to the sweep's effective window (spec §4.D background tasks).
pub const RATE_LIMIT_SWEEP_WINDOW_CAP_MS: u64 = 60_000;
/// Consecutive failed health checks before degraded -> unhealthy (spec §3
/// leaves "N" unspecified; an Open Question decision, see DESIGN.md).
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// HTTP-ish method recognised by a [`RequestDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Inbound request, built by the (external) HTTP edge (spec §6).
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub request_id: String,
    pub path: String,
    pub method: Method,
    pub headers: HashMap<String, Vec<String>>,
    pub query: HashMap<String, Vec<String>>,
    pub body: Value,
    pub auth_context: Option<AuthContext>,
    pub client_id: String,
}

impl RequestDescriptor {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).and_then(|v| v.first()).map(String::as_str)
    }
}

/// Health status of a handler instance (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
struct HealthRecord {
    status: HealthStatus,
    last_check: u64,
    consecutive_failures: u32,
    message: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: now_ms(),
            consecutive_failures: 0,
            message: None,
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;
/// A registered handler function: `(request, global ctx, local ctx) -> response`
/// (spec §9's "strict interface" replacement for a runtime-reflected shape).
pub type HandlerFn =
    Arc<dyn Fn(RequestDescriptor, Arc<GlobalContext>, Arc<LocalContext>) -> HandlerFuture + Send + Sync>;

impl std::fmt::Debug for HandlerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerInstance")
            .field("instance_id", &self.instance_id)
            .field("handler_id", &self.handler_id)
            .field("version", &self.version)
            .field("manifest", &self.manifest)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A bound `(handler function, manifest)` active at a specific `(path, TSV)`.
pub struct HandlerInstance {
    pub instance_id: String,
    pub handler_id: String,
    pub version: Tsv,
    pub handler: HandlerFn,
    pub manifest: Arc<HandlerManifest>,
    health: Mutex<HealthRecord>,
    pub created_at: u64,
    last_accessed: AtomicU64,
}

impl HandlerInstance {
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        self.health.lock().status
    }
}

/// Advisory warm-pool configuration for a handler id (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WarmPoolConfig {
    pub min: u32,
    pub max: u32,
    pub target_utilization: f64,
}

/// Per-instance usage counters (spec §4.D `usageMetrics`).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub last_accessed: u64,
}

/// Successful dispatch output (spec §6 `RoutingResult`).
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub instance: Arc<HandlerInstance>,
    pub manifest: Arc<HandlerManifest>,
    pub version: Tsv,
    pub cached: bool,
    pub transformed_request: Option<Value>,
    pub requires_response_transform: bool,
    pub original_version: Option<Tsv>,
}

/// Route Manager configuration (spec §6 configuration options).
#[derive(Debug, Clone)]
pub struct RouteManagerConfig {
    pub max_cache_size: usize,
    pub health_check_interval: Duration,
    pub rate_limit_cleanup_interval: Duration,
}

impl Default for RouteManagerConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_CACHE_SIZE,
            health_check_interval: HEALTH_SCAN_INTERVAL,
            rate_limit_cleanup_interval: RATE_LIMIT_SWEEP_INTERVAL,
        }
    }
}

/// Component D: the Route Manager.
pub struct RouteManager {
    version_registry: VersionRegistry,
    transformer_engine: TransformerEngine,
    manifest_store: ManifestStore,
    instances: DashMap<(String, String), Arc<HandlerInstance>>,
    manifest_cache: BoundedCache<String, Arc<HandlerManifest>>,
    gtype_cache: BoundedCache<String, Arc<crate::gtype::GType>>,
    health_cache: BoundedCache<String, HealthStatus>,
    rate_limit_state: DashMap<(String, String), (u64, u64)>,
    warm_pools: DashMap<String, WarmPoolConfig>,
    usage_metrics: DashMap<String, UsageMetrics>,
    config: RouteManagerConfig,
}

impl RouteManager {
    /// Build a route manager with the given configuration.
    #[must_use]
    pub fn new(config: RouteManagerConfig) -> Self {
        Self {
            version_registry: VersionRegistry::new(),
            transformer_engine: TransformerEngine::new(),
            manifest_store: ManifestStore::new(),
            instances: DashMap::new(),
            manifest_cache: BoundedCache::new(config.max_cache_size),
            gtype_cache: BoundedCache::new(config.max_cache_size),
            health_cache: BoundedCache::new(config.max_cache_size),
            rate_limit_state: DashMap::new(),
            warm_pools: DashMap::new(),
            usage_metrics: DashMap::new(),
            config,
        }
    }

    /// The Transformer Engine this manager consults for version bridging.
    #[must_use]
    pub fn transformer_engine(&self) -> &TransformerEngine {
        &self.transformer_engine
    }

    /// The Manifest Store backing this manager.
    #[must_use]
    pub fn manifest_store(&self) -> &ManifestStore {
        &self.manifest_store
    }

    /// The Version Registry backing this manager.
    #[must_use]
    pub fn version_registry(&self) -> &VersionRegistry {
        &self.version_registry
    }

    /// `registerHandler(path, tsv, fn, manifest)`.
    pub fn register_handler(&self, path: &str, tsv: Tsv, handler: HandlerFn, manifest: HandlerManifest) {
        let manifest = Arc::new(manifest);
        let instance = Arc::new(HandlerInstance {
            instance_id: format!("{path}@{}", tsv.as_str()),
            handler_id: manifest.handler_id.clone(),
            version: tsv.clone(),
            handler,
            manifest: manifest.clone(),
            health: Mutex::new(HealthRecord::default()),
            created_at: now_ms(),
            last_accessed: AtomicU64::new(now_ms()),
        });

        self.instances.insert((path.to_string(), tsv.as_str().to_string()), instance);
        self.manifest_cache.put(manifest.handler_id.clone(), manifest.clone());
        self.manifest_store.put_manifest((*manifest).clone());
        self.version_registry.register_version(
            path,
            tsv,
            manifest.content_hash.clone(),
            VersionStatus::Hot,
            vec![],
        );
    }

    /// `registerTransformer(pair)`, forwarded to the Transformer Engine.
    pub fn register_transformer(&self, pair: crate::transformer::TransformerPair) {
        self.transformer_engine.register_transformer(pair);
    }

    /// `getInstances(path)`: every distinct TSV registered for `path`.
    #[must_use]
    pub fn get_instances(&self, path: &str) -> Vec<Arc<HandlerInstance>> {
        self.instances
            .iter()
            .filter(|e| e.key().0 == path)
            .map(|e| e.value().clone())
            .collect()
    }

    /// `updateHealth(path, tsv, status)` — external/forced transition.
    pub fn update_health(&self, path: &str, tsv: &Tsv, status: HealthStatus) {
        if let Some(instance) = self.instances.get(&(path.to_string(), tsv.as_str().to_string())) {
            let mut health = instance.health.lock();
            health.status = status;
            health.last_check = now_ms();
            if status != HealthStatus::Unhealthy {
                health.consecutive_failures = 0;
            }
            self.health_cache.put(instance.instance_id.clone(), status);
        }
    }

    /// Record the outcome of an external health probe, applying the
    /// `degraded -> unhealthy after N failures` / `unhealthy -> healthy on
    /// success` transitions (spec §3 Health Status).
    pub fn record_health_check(&self, path: &str, tsv: &Tsv, success: bool) {
        let Some(instance) = self.instances.get(&(path.to_string(), tsv.as_str().to_string())) else {
            return;
        };
        let mut health = instance.health.lock();
        health.last_check = now_ms();
        if success {
            health.consecutive_failures = 0;
            health.status = HealthStatus::Healthy;
            health.message = None;
        } else {
            health.consecutive_failures += 1;
            if health.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
                health.status = HealthStatus::Unhealthy;
            } else if health.status == HealthStatus::Healthy {
                health.status = HealthStatus::Degraded;
            }
        }
        let status = health.status;
        drop(health);
        self.health_cache.put(instance.instance_id.clone(), status);
    }

    /// `maintainWarmPool(handlerId, config)`.
    pub fn maintain_warm_pool(&self, handler_id: impl Into<String>, config: WarmPoolConfig) {
        self.warm_pools.insert(handler_id.into(), config);
    }

    /// `routeRequest(descriptor) -> Result | Error` (spec §4.D, the 8-step
    /// algorithm). Any step returning an error short-circuits the rest.
    ///
    /// Async because step 6's version bridge may invoke the Transformer
    /// Engine, which enforces a per-step timeout ceiling.
    pub async fn route_request(&self, descriptor: &RequestDescriptor) -> Result<RoutingResult> {
        // Step 1: resolve target TSV. query `v` > header `x-api-version` > latest.
        let resolved_tsv = if let Some(v) = descriptor.query_param("v") {
            Tsv::parse(v).map_err(|_| {
                Into::<crate::error::Error>::into(RoutingError::new(
                    RoutingErrorCode::NoVersion,
                    "query parameter v is not a valid TSV",
                ))
            })?
        } else if let Some(v) = descriptor.header("x-api-version") {
            Tsv::parse(v).map_err(|_| {
                Into::<crate::error::Error>::into(RoutingError::new(
                    RoutingErrorCode::NoVersion,
                    "header x-api-version is not a valid TSV",
                ))
            })?
        } else {
            self.version_registry.resolve_latest(&descriptor.path)?
        };

        // Step 2: locate instance.
        let key = (descriptor.path.clone(), resolved_tsv.as_str().to_string());
        let instance = self.instances.get(&key).map(|e| e.value().clone()).ok_or_else(|| {
            RoutingError::new(RoutingErrorCode::NoHandler, "no handler instance registered for this version")
                .with_details(serde_json::json!({ "path": descriptor.path, "version": resolved_tsv.as_str() }))
        })?;

        // Step 2b: request schema validation, if the handler declares one.
        if let Some(gtype_ref) = instance.manifest.request_gtype.clone() {
            let schema = match self.gtype_cache.get(&gtype_ref) {
                Some(schema) => Some(schema),
                None => {
                    let fetched = self.manifest_store.get_gtype(&gtype_ref);
                    if let Some(schema) = &fetched {
                        self.gtype_cache.put(gtype_ref.clone(), schema.clone());
                    }
                    fetched
                }
            };
            if let Some(schema) = schema {
                let issues = crate::gtype::validate(&schema, &descriptor.body);
                if !issues.is_empty() {
                    let message =
                        issues.iter().map(|issue| format!("{}: {}", issue.path, issue.message)).collect::<Vec<_>>().join("; ");
                    return Err(crate::error::Error::Validation(message));
                }
            }
        }

        // Step 3: health gate.
        if instance.health() == HealthStatus::Unhealthy {
            return Err(RoutingError::new(RoutingErrorCode::Unhealthy, "handler instance is unhealthy")
                .with_details(serde_json::json!({ "instanceId": instance.instance_id }))
                .into());
        }

        // Step 4: rate-limit gate.
        if let Some(rate_limit) = instance.manifest.policies.rate_limit {
            let now = now_ms();
            let rl_key = (instance.handler_id.clone(), descriptor.client_id.clone());
            let mut entry = self.rate_limit_state.entry(rl_key).or_insert((now, 0));
            if now.saturating_sub(entry.0) >= rate_limit.window_ms {
                entry.0 = now;
                entry.1 = 0;
            }
            if entry.1 >= rate_limit.limit {
                let current = entry.1;
                return Err(RoutingError::new(RoutingErrorCode::RateLimited, "rate limit exceeded")
                    .with_details(serde_json::json!({
                        "limit": rate_limit.limit,
                        "window": rate_limit.window_ms,
                        "current": current,
                    }))
                    .into());
            }
            entry.1 += 1;
        }

        // Step 5: auth gate.
        if !instance.manifest.policies.roles.is_empty() {
            match &descriptor.auth_context {
                None => {
                    return Err(RoutingError::new(RoutingErrorCode::Unauthorized, "authentication required")
                        .with_details(serde_json::json!({ "requiredRoles": instance.manifest.policies.roles }))
                        .into());
                }
                Some(auth) => {
                    let has_overlap = instance
                        .manifest
                        .policies
                        .roles
                        .iter()
                        .any(|required| auth.roles.contains(required));
                    if !has_overlap {
                        return Err(RoutingError::new(RoutingErrorCode::Unauthorized, "no overlapping role")
                            .with_details(serde_json::json!({
                                "requiredRoles": instance.manifest.policies.roles,
                                "grantedRoles": auth.roles,
                            }))
                            .into());
                    }
                }
            }
        }

        // Step 6: version bridge.
        let mut transformed_request = None;
        let mut requires_response_transform = false;
        let mut original_version = None;
        if let Some(client_version) = descriptor.header("x-gati-version") {
            let client_tsv = Tsv::parse(client_version).ok();
            if let Some(client_tsv) = client_tsv {
                if client_tsv != resolved_tsv {
                    let versions = self.version_registry.get_versions(&descriptor.path).into_iter().map(|r| r.tsv).collect::<Vec<_>>();
                    let outcome = self
                        .transformer_engine
                        .transform_request(descriptor.body.clone(), &client_tsv, &resolved_tsv, &versions)
                        .await;
                    if !outcome.success {
                        return Err(RoutingError::new(
                            RoutingErrorCode::NoVersion,
                            format!("version bridge failed: {}", outcome.error.unwrap_or_default()),
                        )
                        .with_details(serde_json::json!({ "from": client_tsv.as_str(), "to": resolved_tsv.as_str() }))
                        .into());
                    }
                    transformed_request = Some(outcome.data);
                    requires_response_transform = true;
                    original_version = Some(client_tsv);
                }
            }
        }

        // Step 7: accounting.
        instance.last_accessed.store(now_ms(), Ordering::Relaxed);
        self.version_registry.record_request(&resolved_tsv);
        self.usage_metrics
            .entry(instance.instance_id.clone())
            .and_modify(|m| {
                m.request_count += 1;
                m.last_accessed = now_ms();
            })
            .or_insert(UsageMetrics {
                request_count: 1,
                error_count: 0,
                avg_latency_ms: 0.0,
                last_accessed: now_ms(),
            });

        // Step 8: return.
        Ok(RoutingResult {
            manifest: instance.manifest.clone(),
            instance,
            version: resolved_tsv,
            cached: false,
            transformed_request,
            requires_response_transform,
            original_version,
        })
    }

    /// Health scan background task (spec §4.D): instances idle past
    /// [`HEALTH_INACTIVITY_THRESHOLD`] while `healthy` degrade.
    pub fn scan_health(&self) {
        let now = now_ms();
        let threshold_ms = HEALTH_INACTIVITY_THRESHOLD.as_millis() as u64;
        for entry in &self.instances {
            let instance = entry.value();
            let last = instance.last_accessed.load(Ordering::Relaxed);
            if now.saturating_sub(last) > threshold_ms {
                let mut health = instance.health.lock();
                if health.status == HealthStatus::Healthy {
                    health.status = HealthStatus::Degraded;
                    health.last_check = now;
                }
            }
        }
    }

    /// Rate-limit sweep background task (spec §4.D): drops windows older
    /// than the max configured window, capped at [`RATE_LIMIT_SWEEP_WINDOW_CAP_MS`].
    pub fn sweep_rate_limits(&self) {
        let now = now_ms();
        let max_window = self
            .instances
            .iter()
            .filter_map(|e| e.value().manifest.policies.rate_limit.map(|r| r.window_ms))
            .max()
            .unwrap_or(RATE_LIMIT_SWEEP_WINDOW_CAP_MS)
            .min(RATE_LIMIT_SWEEP_WINDOW_CAP_MS);
        self.rate_limit_state.retain(|_, (window_start, _)| now.saturating_sub(*window_start) <= max_window);
    }

    /// Spawn the health-scan and rate-limit-sweep background tasks.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let health_mgr = self.clone();
        let health_interval = self.config.health_check_interval;
        let health = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            loop {
                ticker.tick().await;
                health_mgr.scan_health();
            }
        });

        let sweep_mgr = self.clone();
        let sweep_interval = self.config.rate_limit_cleanup_interval;
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                sweep_mgr.sweep_rate_limits();
            }
        });

        (health, sweep)
    }

    /// Point-in-time usage metrics for an instance id.
    #[must_use]
    pub fn usage_metrics(&self, instance_id: &str) -> Option<UsageMetrics> {
        self.usage_metrics.get(instance_id).map(|e| *e.value())
    }

    /// Cache-hit accessors exposed mainly for tests and diagnostics.
    #[must_use]
    pub fn manifest_cache_stats(&self) -> crate::cache::CacheStats {
        self.manifest_cache.stats()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
