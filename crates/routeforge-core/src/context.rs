//! Component G — Context Pair (spec §4.G).
//!
//! `GlobalContext` is process-lifetime, `LocalContext` is request-lifetime.
//! The local context's lifecycle handle is grounded on the reference
//! gateway's task-local trace propagation (`gateway/trace.rs`) generalized
//! from a single trace id into the full `onCleanup/onTimeout/onError/
//! onPhaseChange` callback set the spec names, and on the explicit
//! `RequestLifecycle` value called for by the "closures carrying cleanup
//! hooks in hidden symbols" re-architecture note in spec §9.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use uuid::Uuid;

/// Identity of this process instance.
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    /// Stable instance id (e.g. pod name, generated uuid).
    pub id: String,
    /// Deployment region, if known.
    pub region: Option<String>,
    /// Deployment zone, if known.
    pub zone: Option<String>,
    /// Unix-ms the process started.
    pub started_at: u64,
}

impl InstanceIdentity {
    /// Build an identity with a freshly generated id and the current time.
    #[must_use]
    pub fn new(region: Option<String>, zone: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            region,
            zone,
            started_at: now_ms(),
        }
    }
}

/// A registered startup/shutdown hook, run in priority order (lower first).
type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Broadcast-style hook sinks the global context exposes (spec §4.G).
#[derive(Default)]
struct BroadcastHooks {
    config_reload: Vec<Arc<dyn Fn(&Value) + Send + Sync>>,
    memory_pressure: Vec<Arc<dyn Fn(u8) + Send + Sync>>,
    circuit_breaker: Vec<Arc<dyn Fn(&str) + Send + Sync>>,
}

/// Process-wide context (spec §3, §4.G). Lifetime = process.
pub struct GlobalContext {
    /// Process identity.
    pub identity: InstanceIdentity,
    modules: RwLock<HashMap<String, Arc<dyn std::any::Any + Send + Sync>>>,
    services: RwLock<HashMap<String, Arc<dyn std::any::Any + Send + Sync>>>,
    config_snapshot: RwLock<Value>,
    state: RwLock<Value>,
    startup_hooks: Mutex<Vec<(i32, LifecycleHook)>>,
    shutdown_hooks: Mutex<Vec<(i32, LifecycleHook)>>,
    health_checks: RwLock<HashMap<String, Arc<dyn Fn() -> bool + Send + Sync>>>,
    broadcast: RwLock<BroadcastHooks>,
}

impl GlobalContext {
    /// Create a new global context with the given identity and initial
    /// configuration snapshot.
    #[must_use]
    pub fn new(identity: InstanceIdentity, config_snapshot: Value) -> Self {
        Self {
            identity,
            modules: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            config_snapshot: RwLock::new(config_snapshot),
            state: RwLock::new(Value::Object(serde_json::Map::new())),
            startup_hooks: Mutex::new(Vec::new()),
            shutdown_hooks: Mutex::new(Vec::new()),
            health_checks: RwLock::new(HashMap::new()),
            broadcast: RwLock::new(BroadcastHooks::default()),
        }
    }

    /// Register a named module handle.
    pub fn register_module(&self, name: impl Into<String>, module: Arc<dyn std::any::Any + Send + Sync>) {
        self.modules.write().insert(name.into(), module);
    }

    /// Fetch a named module handle.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.modules.read().get(name).cloned()
    }

    /// Register a named service handle.
    pub fn register_service(&self, name: impl Into<String>, service: Arc<dyn std::any::Any + Send + Sync>) {
        self.services.write().insert(name.into(), service);
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config_snapshot(&self) -> Value {
        self.config_snapshot.read().clone()
    }

    /// Replace the configuration snapshot and notify config-reload hooks.
    pub fn reload_config(&self, new_config: Value) {
        *self.config_snapshot.write() = new_config.clone();
        for hook in &self.broadcast.read().config_reload {
            hook(&new_config);
        }
    }

    /// Broadcast a memory-pressure level (0-100) to registered hooks.
    pub fn broadcast_memory_pressure(&self, level: u8) {
        for hook in &self.broadcast.read().memory_pressure {
            hook(level);
        }
    }

    /// Broadcast a circuit-breaker transition (e.g. `"open"`, `"closed"`).
    pub fn broadcast_circuit_breaker(&self, state: &str) {
        for hook in &self.broadcast.read().circuit_breaker {
            hook(state);
        }
    }

    /// Subscribe to config-reload broadcasts.
    pub fn on_config_reload(&self, f: impl Fn(&Value) + Send + Sync + 'static) {
        self.broadcast.write().config_reload.push(Arc::new(f));
    }

    /// Subscribe to memory-pressure broadcasts.
    pub fn on_memory_pressure(&self, f: impl Fn(u8) + Send + Sync + 'static) {
        self.broadcast.write().memory_pressure.push(Arc::new(f));
    }

    /// Subscribe to circuit-breaker broadcasts.
    pub fn on_circuit_breaker(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.broadcast.write().circuit_breaker.push(Arc::new(f));
    }

    /// Register a named health check, queried by external probes.
    pub fn register_health_check(&self, name: impl Into<String>, check: Arc<dyn Fn() -> bool + Send + Sync>) {
        self.health_checks.write().insert(name.into(), check);
    }

    /// Run every registered health check, returning `(name, healthy)` pairs.
    #[must_use]
    pub fn run_health_checks(&self) -> Vec<(String, bool)> {
        self.health_checks
            .read()
            .iter()
            .map(|(name, check)| (name.clone(), check()))
            .collect()
    }

    /// Register a startup hook at the given priority (lower runs first).
    pub fn on_startup(&self, priority: i32, f: impl Fn() + Send + Sync + 'static) {
        let mut hooks = self.startup_hooks.lock();
        hooks.push((priority, Arc::new(f)));
        hooks.sort_by_key(|(p, _)| *p);
    }

    /// Register a shutdown hook at the given priority (lower runs first).
    pub fn on_shutdown(&self, priority: i32, f: impl Fn() + Send + Sync + 'static) {
        let mut hooks = self.shutdown_hooks.lock();
        hooks.push((priority, Arc::new(f)));
        hooks.sort_by_key(|(p, _)| *p);
    }

    /// Run every startup hook in priority order.
    pub fn run_startup(&self) {
        for (_, hook) in self.startup_hooks.lock().iter() {
            hook();
        }
    }

    /// Run every shutdown hook in priority order.
    pub fn run_shutdown(&self) {
        for (_, hook) in self.shutdown_hooks.lock().iter() {
            hook();
        }
    }

    /// Read-modify the process-wide state bag under a closure.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.state.write())
    }
}

/// Request phases (spec §4.G), ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    /// Just arrived, nothing processed yet.
    #[default]
    Received,
    /// Request/response validation in progress.
    Validating,
    /// Handler (and hooks) executing.
    Processing,
    /// Response is being written back.
    Responding,
    /// Terminal: completed successfully.
    Completed,
    /// Terminal: failed.
    Failed,
}

/// Auth context attached to a request, if the caller authenticated
/// (spec §6 `RequestDescriptor.authContext`).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AuthContext {
    /// Authenticated user id, if known.
    pub user_id: Option<String>,
    /// Roles granted to this caller.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Opaque bearer token, if present.
    pub token: Option<String>,
}

type PhaseHook = Arc<dyn Fn(Phase, Phase) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;
type VoidHook = Arc<dyn Fn() + Send + Sync>;

/// The per-request lifecycle handle owned by [`LocalContext`]. Replaces the
/// "closures carrying cleanup hooks in hidden symbols" pattern named in
/// spec §9 with an explicit value.
#[derive(Default)]
pub struct RequestLifecycle {
    cleanup_hooks: Mutex<Vec<VoidHook>>,
    timeout_hooks: Mutex<Vec<VoidHook>>,
    error_hooks: Mutex<Vec<ErrorHook>>,
    phase_hooks: Mutex<Vec<PhaseHook>>,
    phase: Mutex<Phase>,
    cleaning_up: AtomicBool,
    timed_out: AtomicBool,
}

impl RequestLifecycle {
    /// Build a handle starting in `Phase::Received`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup hook, run by `executeCleanup`.
    pub fn on_cleanup(&self, f: impl Fn() + Send + Sync + 'static) {
        self.cleanup_hooks.lock().push(Arc::new(f));
    }

    /// Register a timeout hook.
    pub fn on_timeout(&self, f: impl Fn() + Send + Sync + 'static) {
        self.timeout_hooks.lock().push(Arc::new(f));
    }

    /// Register an error hook.
    pub fn on_error(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.error_hooks.lock().push(Arc::new(f));
    }

    /// Register a phase-change hook, invoked with `(from, to)`.
    pub fn on_phase_change(&self, f: impl Fn(Phase, Phase) + Send + Sync + 'static) {
        self.phase_hooks.lock().push(Arc::new(f));
    }

    /// Advance the phase, firing phase-change hooks.
    pub fn set_phase(&self, next: Phase) {
        let prev = {
            let mut phase = self.phase.lock();
            let prev = *phase;
            *phase = next;
            prev
        };
        if prev != next {
            for hook in self.phase_hooks.lock().iter() {
                hook(prev, next);
            }
        }
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Mark the request as timed out and fire timeout hooks.
    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        for hook in self.timeout_hooks.lock().iter() {
            hook();
        }
    }

    /// Fire error hooks with `message`.
    pub fn notify_error(&self, message: &str) {
        for hook in self.error_hooks.lock().iter() {
            hook(message);
        }
    }

    /// Run every cleanup hook exactly once; re-entrant calls are no-ops.
    pub fn execute_cleanup(&self) {
        if self.cleaning_up.swap(true, Ordering::SeqCst) {
            return;
        }
        for hook in self.cleanup_hooks.lock().iter() {
            hook();
        }
    }

    /// Whether `execute_cleanup` has been called.
    #[must_use]
    pub fn is_cleaning_up(&self) -> bool {
        self.cleaning_up.load(Ordering::SeqCst)
    }

    /// Whether `mark_timed_out` has been called.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

/// Per-request context (spec §3, §4.G). Lifetime = request. Never shared
/// across requests — each `routeRequest` call owns a fresh instance, so the
/// state bag is necessarily disjoint across concurrent requests (invariant
/// 2 in spec §8).
pub struct LocalContext {
    /// Request id, generated if the caller didn't supply one.
    pub request_id: String,
    /// Distributed trace id.
    pub trace_id: Option<String>,
    /// Parent span id, if this request is part of a larger trace.
    pub parent_span_id: Option<String>,
    /// Client identifier, used for rate limiting.
    pub client_id: String,
    /// Session/user/tenant reference ids.
    pub refs: HashMap<String, String>,
    /// Arbitrary client metadata (user agent, IP, etc).
    pub client_meta: HashMap<String, String>,
    /// Auth context, if the caller authenticated.
    pub auth: Option<AuthContext>,
    state: Mutex<Value>,
    /// Per-request lifecycle handle.
    pub lifecycle: Arc<RequestLifecycle>,
}

impl LocalContext {
    /// Build a local context for a request, generating a request id if none
    /// was supplied.
    #[must_use]
    pub fn new(request_id: Option<String>, client_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            trace_id: None,
            parent_span_id: None,
            client_id: client_id.into(),
            refs: HashMap::new(),
            client_meta: HashMap::new(),
            auth: None,
            state: Mutex::new(Value::Object(serde_json::Map::new())),
            lifecycle: Arc::new(RequestLifecycle::new()),
        }
    }

    /// Read-modify the request-scoped state bag.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.state.lock())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_context_generates_request_id_when_absent() {
        let lctx = LocalContext::new(None, "client-1");
        assert!(!lctx.request_id.is_empty());
    }

    #[test]
    fn state_bags_are_independent_per_context() {
        let a = LocalContext::new(None, "c1");
        let b = LocalContext::new(None, "c2");
        a.with_state(|s| *s = serde_json::json!({ "x": 1 }));
        b.with_state(|s| *s = serde_json::json!({ "x": 2 }));
        assert_eq!(a.with_state(|s| s.clone())["x"], 1);
        assert_eq!(b.with_state(|s| s.clone())["x"], 2);
    }

    #[test]
    fn phase_transitions_fire_hooks_with_from_and_to() {
        let lifecycle = RequestLifecycle::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        lifecycle.on_phase_change(move |from, to| seen2.lock().push((from, to)));
        lifecycle.set_phase(Phase::Validating);
        lifecycle.set_phase(Phase::Processing);
        let log = seen.lock();
        assert_eq!(*log, vec![(Phase::Received, Phase::Validating), (Phase::Validating, Phase::Processing)]);
    }

    #[test]
    fn cleanup_runs_exactly_once() {
        let lifecycle = RequestLifecycle::new();
        let count = Arc::new(AtomicU64::new(0));
        let count2 = count.clone();
        lifecycle.on_cleanup(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        lifecycle.execute_cleanup();
        lifecycle.execute_cleanup();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn config_reload_notifies_subscribers() {
        let gctx = GlobalContext::new(InstanceIdentity::new(None, None), serde_json::json!({}));
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        gctx.on_config_reload(move |cfg| *seen2.lock() = Some(cfg.clone()));
        gctx.reload_config(serde_json::json!({ "a": 1 }));
        assert_eq!(seen.lock().clone().unwrap()["a"], 1);
    }

    use std::sync::atomic::AtomicU64;
}
