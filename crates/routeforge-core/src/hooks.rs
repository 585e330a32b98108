//! Component F — Hook Orchestrator (spec §4.F).
//!
//! Runs `before`/`after`/`catch` hook pipelines around a handler with
//! per-hook timeout and retry, saga-style compensating actions, and a
//! structured lifecycle event stream. Grounded on the reference gateway's
//! `CircuitBreaker` (`failsafe/circuit_breaker.rs`) for the "race against a
//! deadline, retry N more times, otherwise raise" shape, generalized from a
//! single breaker state machine into an ordered pipeline of independently
//! configured hooks. Retries run through `backon`'s finite-state retry
//! driver rather than a hand-rolled loop-over-exceptions, per the RPC
//! retry/backoff re-architecture note in spec §9. The event sink is a plain
//! `Fn(LifecycleEvent)` rather than an `EventEmitter`, per the pub/sub
//! re-architecture note in the same section.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backon::{ConstantBuilder, Retryable};
use parking_lot::Mutex;
use serde_json::Value;

use crate::context::{GlobalContext, LocalContext};
use crate::error::{HookError, Result};
use crate::gtype::GType;

/// Default per-hook timeout (spec §4.F).
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);
/// Default retry count (spec §4.F).
pub const DEFAULT_RETRIES: u32 = 0;

/// Level a hook is registered at, controlling pipeline ordering (spec §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookLevel {
    Global,
    Route,
    Local,
}

type HookFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;
/// A hook function: `(lctx, gctx) -> Result<(), String>`.
pub type HookFn = Arc<dyn Fn(Arc<LocalContext>, Arc<GlobalContext>) -> HookFuture + Send + Sync>;

/// A registered hook (spec §4.F).
#[derive(Clone)]
pub struct Hook {
    pub id: String,
    pub level: HookLevel,
    pub timeout: Duration,
    pub retries: u32,
    pub func: HookFn,
}

impl Hook {
    /// Build a hook with the default timeout and retry count.
    #[must_use]
    pub fn new(id: impl Into<String>, level: HookLevel, func: HookFn) -> Self {
        Self { id: id.into(), level, timeout: DEFAULT_HOOK_TIMEOUT, retries: DEFAULT_RETRIES, func }
    }

    /// Override the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Per-attempt outcome fed to `backon`'s retry driver; collapsed into a
/// [`HookError`] once retries are exhausted.
#[derive(Debug, Clone)]
enum AttemptError {
    Timeout,
    Failed(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::Failed(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for AttemptError {}

/// A compensating action registered during a hook's success path, run in
/// LIFO order during `executeCatch` (spec §4.F, glossary "Compensating Action").
pub type CompensationFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>> + Send + Sync>;

struct Compensation {
    id: String,
    func: CompensationFn,
}

/// Lifecycle event emitted by the orchestrator (spec §6 event shape).
#[derive(Debug, Clone, serde::Serialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: u64,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Sink every lifecycle event is emitted through (spec §4.F "caller-supplied sink").
pub type EventSink = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Component F: the Hook Orchestrator.
pub struct HookOrchestrator {
    before: Mutex<Vec<Hook>>,
    after: Mutex<Vec<Hook>>,
    catch: Mutex<Vec<Hook>>,
    compensations: Mutex<Vec<Compensation>>,
    sink: Option<EventSink>,
}

impl HookOrchestrator {
    /// Build an orchestrator, optionally wired to an event sink.
    #[must_use]
    pub fn new(sink: Option<EventSink>) -> Self {
        Self {
            before: Mutex::new(Vec::new()),
            after: Mutex::new(Vec::new()),
            catch: Mutex::new(Vec::new()),
            compensations: Mutex::new(Vec::new()),
            sink,
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    /// Emit a `handler:start`/`handler:end`/`handler:error` lifecycle event
    /// (spec §6 event shape). The Dispatcher calls this around the handler
    /// invocation itself, which the orchestrator otherwise never touches.
    pub fn emit_handler_event(&self, kind: &str, request_id: &str, error: Option<String>, duration_ms: Option<u64>) {
        self.emit(LifecycleEvent {
            kind: kind.to_string(),
            timestamp: now_ms(),
            request_id: request_id.to_string(),
            hook_id: None,
            error,
            duration_ms,
            metadata: None,
        });
    }

    /// Register a `before` hook. Pipeline order is `global -> route -> local`.
    pub fn register_before(&self, hook: Hook) {
        insert_sorted(&mut self.before.lock(), hook, false);
    }

    /// Register an `after` hook. Pipeline order is `local -> route -> global`.
    pub fn register_after(&self, hook: Hook) {
        insert_sorted(&mut self.after.lock(), hook, true);
    }

    /// Register a `catch` hook. Pipeline order is `local -> route -> global`.
    pub fn register_catch(&self, hook: Hook) {
        insert_sorted(&mut self.catch.lock(), hook, true);
    }

    /// Register a compensating action, run LIFO during `executeCatch`.
    pub fn register_compensating_action(&self, id: impl Into<String>, func: CompensationFn) {
        self.compensations.lock().push(Compensation { id: id.into(), func });
    }

    /// Clear all compensating actions registered so far (e.g. after a
    /// request completes successfully with nothing left to roll back).
    pub fn clear_compensations(&self) {
        self.compensations.lock().clear();
    }

    /// `executeBefore(lctx, gctx)`: walk the `before` list in order, racing
    /// each hook against its timeout and retrying up to `retries` times. The
    /// first hook that exhausts its attempts stops the remaining `before`
    /// hooks and raises.
    pub async fn execute_before(&self, lctx: Arc<LocalContext>, gctx: Arc<GlobalContext>) -> Result<()> {
        let hooks = self.before.lock().clone();
        self.run_pipeline(&hooks, lctx, gctx).await
    }

    /// `executeAfter`: identical shape, walking the `after` list.
    pub async fn execute_after(&self, lctx: Arc<LocalContext>, gctx: Arc<GlobalContext>) -> Result<()> {
        let hooks = self.after.lock().clone();
        self.run_pipeline(&hooks, lctx, gctx).await
    }

    async fn run_pipeline(&self, hooks: &[Hook], lctx: Arc<LocalContext>, gctx: Arc<GlobalContext>) -> Result<()> {
        for hook in hooks {
            self.run_hook_with_retries(hook, lctx.clone(), gctx.clone(), &lctx.request_id).await?;
        }
        Ok(())
    }

    async fn run_hook_with_retries(
        &self,
        hook: &Hook,
        lctx: Arc<LocalContext>,
        gctx: Arc<GlobalContext>,
        request_id: &str,
    ) -> Result<()> {
        let attempts = AtomicU32::new(0);
        let backoff = ConstantBuilder::default().with_delay(Duration::ZERO).with_max_times(hook.retries as usize);

        let op = || {
            let lctx = lctx.clone();
            let gctx = gctx.clone();
            let func = hook.func.clone();
            let hook_id = hook.id.clone();
            let timeout = hook.timeout;
            let attempts = &attempts;
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.emit(LifecycleEvent {
                    kind: "hook:start".to_string(),
                    timestamp: now_ms(),
                    request_id: request_id.to_string(),
                    hook_id: Some(hook_id.clone()),
                    error: None,
                    duration_ms: None,
                    metadata: None,
                });
                let started = now_ms();
                let outcome = tokio::time::timeout(timeout, func(lctx, gctx)).await;
                let duration_ms = now_ms().saturating_sub(started);
                let attempt_err = match outcome {
                    Ok(Ok(())) => {
                        self.emit(LifecycleEvent {
                            kind: "hook:end".to_string(),
                            timestamp: now_ms(),
                            request_id: request_id.to_string(),
                            hook_id: Some(hook_id),
                            error: None,
                            duration_ms: Some(duration_ms),
                            metadata: None,
                        });
                        return Ok(());
                    }
                    Ok(Err(message)) => AttemptError::Failed(message),
                    Err(_) => AttemptError::Timeout,
                };
                self.emit(LifecycleEvent {
                    kind: "hook:error".to_string(),
                    timestamp: now_ms(),
                    request_id: request_id.to_string(),
                    hook_id: Some(hook_id),
                    error: Some(attempt_err.to_string()),
                    duration_ms: Some(duration_ms),
                    metadata: None,
                });
                Err(attempt_err)
            }
        };

        let hook_id = hook.id.clone();
        let result = op
            .retry(&backoff)
            .notify(|err: &AttemptError, _dur| {
                self.emit(LifecycleEvent {
                    kind: "hook:retry".to_string(),
                    timestamp: now_ms(),
                    request_id: request_id.to_string(),
                    hook_id: Some(hook_id.clone()),
                    error: Some(err.to_string()),
                    duration_ms: None,
                    metadata: Some(serde_json::json!({ "attempt": attempts.load(Ordering::SeqCst) + 1 })),
                });
            })
            .await;

        result.map_err(|attempt_err| {
            let total_attempts = attempts.load(Ordering::SeqCst);
            let err = match attempt_err {
                AttemptError::Timeout => HookError::Timeout { hook_id: hook.id.clone(), attempts: total_attempts },
                AttemptError::Failed(message) => {
                    HookError::Failed { hook_id: hook.id.clone(), attempts: total_attempts, message }
                }
            };
            err.into()
        })
    }

    /// `executeCatch(err, lctx, gctx)`: run compensations LIFO (errors
    /// logged via `compensation:error`/`compensation:alert` but never stop
    /// the remaining ones), then run the `catch` list with hook errors
    /// swallowed so the termination path is never blocked.
    pub async fn execute_catch(&self, err: &str, lctx: Arc<LocalContext>, gctx: Arc<GlobalContext>) {
        let compensations: Vec<Compensation> = {
            let mut guard = self.compensations.lock();
            std::mem::take(&mut *guard)
        };
        for comp in compensations.into_iter().rev() {
            self.emit(LifecycleEvent {
                kind: "compensation:start".to_string(),
                timestamp: now_ms(),
                request_id: lctx.request_id.clone(),
                hook_id: Some(comp.id.clone()),
                error: None,
                duration_ms: None,
                metadata: None,
            });
            match (comp.func)().await {
                Ok(()) => {
                    self.emit(LifecycleEvent {
                        kind: "compensation:end".to_string(),
                        timestamp: now_ms(),
                        request_id: lctx.request_id.clone(),
                        hook_id: Some(comp.id.clone()),
                        error: None,
                        duration_ms: None,
                        metadata: None,
                    });
                }
                Err(message) => {
                    tracing::error!(compensation = %comp.id, error = %message, "compensating action failed");
                    self.emit(LifecycleEvent {
                        kind: "compensation:error".to_string(),
                        timestamp: now_ms(),
                        request_id: lctx.request_id.clone(),
                        hook_id: Some(comp.id.clone()),
                        error: Some(message.clone()),
                        duration_ms: None,
                        metadata: None,
                    });
                    self.emit(LifecycleEvent {
                        kind: "compensation:alert".to_string(),
                        timestamp: now_ms(),
                        request_id: lctx.request_id.clone(),
                        hook_id: Some(comp.id.clone()),
                        error: Some(message),
                        duration_ms: None,
                        metadata: None,
                    });
                }
            }
        }

        let hooks = self.catch.lock().clone();
        for hook in &hooks {
            let result = tokio::time::timeout(hook.timeout, (hook.func)(lctx.clone(), gctx.clone())).await;
            if let Err(_) | Ok(Err(_)) = result {
                tracing::warn!(hook = %hook.id, original_error = %err, "catch hook failed, swallowing");
            }
        }
    }

    /// `validateRequest`/`validateResponse`: delegate to the structural
    /// [`GType`] validator, emitting `validation:start/end/error`.
    pub fn validate(&self, kind: &str, request_id: &str, schema: &GType, value: &Value) -> Result<()> {
        self.emit(LifecycleEvent {
            kind: "validation:start".to_string(),
            timestamp: now_ms(),
            request_id: request_id.to_string(),
            hook_id: None,
            error: None,
            duration_ms: None,
            metadata: Some(serde_json::json!({ "kind": kind })),
        });
        let issues = crate::gtype::validate(schema, value);
        if issues.is_empty() {
            self.emit(LifecycleEvent {
                kind: "validation:end".to_string(),
                timestamp: now_ms(),
                request_id: request_id.to_string(),
                hook_id: None,
                error: None,
                duration_ms: None,
                metadata: Some(serde_json::json!({ "kind": kind })),
            });
            Ok(())
        } else {
            let message = issues.into_iter().map(|i| format!("{}: {}", i.path, i.message)).collect::<Vec<_>>().join("; ");
            self.emit(LifecycleEvent {
                kind: "validation:error".to_string(),
                timestamp: now_ms(),
                request_id: request_id.to_string(),
                hook_id: None,
                error: Some(message.clone()),
                duration_ms: None,
                metadata: Some(serde_json::json!({ "kind": kind })),
            });
            Err(crate::error::Error::Validation(message))
        }
    }
}

fn insert_sorted(hooks: &mut Vec<Hook>, hook: Hook, reverse: bool) {
    hooks.push(hook);
    if reverse {
        hooks.sort_by(|a, b| b.level.cmp(&a.level));
    } else {
        hooks.sort_by(|a, b| a.level.cmp(&b.level));
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ok_hook(id: &str, level: HookLevel) -> Hook {
        Hook::new(id, level, Arc::new(|_, _| Box::pin(async { Ok(()) })))
    }

    fn lctx() -> Arc<LocalContext> {
        Arc::new(LocalContext::new(None, "c1"))
    }

    fn gctx() -> Arc<GlobalContext> {
        Arc::new(GlobalContext::new(crate::context::InstanceIdentity::new(None, None), serde_json::json!({})))
    }

    #[tokio::test]
    async fn before_hooks_run_global_then_route_then_local() {
        let orch = HookOrchestrator::new(None);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (id, level) in [("local1", HookLevel::Local), ("global1", HookLevel::Global), ("route1", HookLevel::Route)] {
            let order = order.clone();
            let id_owned = id.to_string();
            orch.register_before(Hook::new(
                id,
                level,
                Arc::new(move |_, _| {
                    let order = order.clone();
                    let id_owned = id_owned.clone();
                    Box::pin(async move {
                        order.lock().push(id_owned);
                        Ok(())
                    })
                }),
            ));
        }
        orch.execute_before(lctx(), gctx()).await.unwrap();
        assert_eq!(*order.lock(), vec!["global1", "route1", "local1"]);
    }

    #[tokio::test]
    async fn after_hooks_run_local_then_route_then_global() {
        let orch = HookOrchestrator::new(None);
        orch.register_after(ok_hook("g", HookLevel::Global));
        orch.register_after(ok_hook("r", HookLevel::Route));
        orch.register_after(ok_hook("l", HookLevel::Local));
        orch.execute_after(lctx(), gctx()).await.unwrap();
    }

    #[tokio::test]
    async fn hook_retries_then_succeeds() {
        let orch = HookOrchestrator::new(None);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let hook = Hook::new(
            "flaky",
            HookLevel::Global,
            Arc::new(move |_, _| {
                let attempts2 = attempts2.clone();
                Box::pin(async move {
                    let n = attempts2.fetch_add(1, Ordering::SeqCst);
                    if n < 2 { Err("not yet".to_string()) } else { Ok(()) }
                })
            }),
        )
        .with_retries(3);
        orch.register_before(hook);
        orch.execute_before(lctx(), gctx()).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hook_fails_after_exhausting_retries() {
        let orch = HookOrchestrator::new(None);
        let hook = Hook::new("always_fails", HookLevel::Global, Arc::new(|_, _| Box::pin(async { Err("nope".to_string()) })))
            .with_retries(1);
        orch.register_before(hook);
        let err = orch.execute_before(lctx(), gctx()).await.unwrap_err();
        match err {
            crate::error::Error::Hook(HookError::Failed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn compensations_run_lifo_and_survive_individual_failures() {
        let orch = HookOrchestrator::new(None);
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in ["c1", "c2", "c3"] {
            let order = order.clone();
            let id_owned = id.to_string();
            orch.register_compensating_action(
                id,
                Arc::new(move || {
                    let order = order.clone();
                    let id_owned = id_owned.clone();
                    Box::pin(async move {
                        if id_owned == "c2" {
                            return Err("c2 boom".to_string());
                        }
                        order.lock().push(id_owned);
                        Ok(())
                    })
                }),
            );
        }
        orch.execute_catch("original", lctx(), gctx()).await;
        assert_eq!(*order.lock(), vec!["c3", "c1"]);
    }
}
