//! Dispatcher — composes the Route Manager (component D) and Hook
//! Orchestrator (component F) for the "invoke the handler" half of the
//! request flow described in spec §2: resolve, run `before` hooks, invoke
//! the handler, run `after`/`catch` hooks, optionally down-convert the
//! response. `RouteManager::route_request` itself only performs resolution
//! and returns a [`RoutingResult`]; it never invokes hooks or the handler.

use std::sync::Arc;

use serde_json::Value;

use crate::context::{GlobalContext, LocalContext};
use crate::error::Result;
use crate::hooks::HookOrchestrator;
use crate::route_manager::{RequestDescriptor, RouteManager};

/// Outcome of a full dispatch: resolution result plus the handler's
/// response, already down-converted to the client's native version when
/// the route required it.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub response: Value,
    pub version: crate::tsv::Tsv,
}

/// Composes a [`RouteManager`] and [`HookOrchestrator`] into the full
/// resolve -> before -> handler -> after/catch -> response-transform flow.
pub struct Dispatcher {
    route_manager: Arc<RouteManager>,
    hooks: Arc<HookOrchestrator>,
}

impl Dispatcher {
    /// Build a dispatcher over the given Route Manager and Hook Orchestrator.
    #[must_use]
    pub fn new(route_manager: Arc<RouteManager>, hooks: Arc<HookOrchestrator>) -> Self {
        Self { route_manager, hooks }
    }

    /// The underlying Route Manager.
    #[must_use]
    pub fn route_manager(&self) -> &Arc<RouteManager> {
        &self.route_manager
    }

    /// The underlying Hook Orchestrator.
    #[must_use]
    pub fn hooks(&self) -> &Arc<HookOrchestrator> {
        &self.hooks
    }

    /// Run the full dispatch pipeline for `descriptor`.
    ///
    /// On a hook or handler failure, `executeCatch` runs (including any
    /// compensating actions registered by `before` hooks or the handler)
    /// before the error is returned to the caller.
    pub async fn dispatch(
        &self,
        descriptor: RequestDescriptor,
        gctx: Arc<GlobalContext>,
        lctx: Arc<LocalContext>,
    ) -> Result<DispatchOutcome> {
        lctx.lifecycle.set_phase(crate::context::Phase::Validating);
        let routing = self.route_manager.route_request(&descriptor).await?;

        lctx.lifecycle.set_phase(crate::context::Phase::Processing);
        let request_body = routing.transformed_request.clone().unwrap_or_else(|| descriptor.body.clone());
        let mut request_for_handler = descriptor.clone();
        request_for_handler.body = request_body;

        let result = self.run_handler(&routing, request_for_handler, gctx.clone(), lctx.clone()).await;

        match result {
            Ok(mut response) => {
                lctx.lifecycle.set_phase(crate::context::Phase::Responding);
                if routing.requires_response_transform {
                    if let Some(original_version) = &routing.original_version {
                        let versions = self
                            .route_manager
                            .version_registry()
                            .get_versions(&descriptor.path)
                            .into_iter()
                            .map(|r| r.tsv)
                            .collect::<Vec<_>>();
                        let outcome = self
                            .route_manager
                            .transformer_engine()
                            .transform_response(response.clone(), &routing.version, original_version, &versions)
                            .await;
                        if outcome.success {
                            response = outcome.data;
                        }
                    }
                }
                self.hooks.clear_compensations();
                lctx.lifecycle.set_phase(crate::context::Phase::Completed);
                Ok(DispatchOutcome { response, version: routing.version })
            }
            Err(err) => {
                lctx.lifecycle.notify_error(&err.to_string());
                self.hooks.execute_catch(&err.to_string(), lctx.clone(), gctx).await;
                lctx.lifecycle.set_phase(crate::context::Phase::Failed);
                Err(err)
            }
        }
    }

    async fn run_handler(
        &self,
        routing: &crate::route_manager::RoutingResult,
        request: RequestDescriptor,
        gctx: Arc<GlobalContext>,
        lctx: Arc<LocalContext>,
    ) -> Result<Value> {
        self.hooks.execute_before(lctx.clone(), gctx.clone()).await?;
        let handler = routing.instance.handler.clone();
        self.hooks.emit_handler_event("handler:start", &lctx.request_id, None, None);
        let started = std::time::Instant::now();
        let outcome = handler(request, gctx.clone(), lctx.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let response = match outcome {
            Ok(value) => {
                self.hooks.emit_handler_event("handler:end", &lctx.request_id, None, Some(duration_ms));
                value
            }
            Err(message) => {
                self.hooks.emit_handler_event("handler:error", &lctx.request_id, Some(message.clone()), Some(duration_ms));
                return Err(crate::error::Error::Handler(message));
            }
        };
        self.hooks.execute_after(lctx, gctx).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InstanceIdentity;
    use crate::hooks::{Hook, HookLevel};
    use crate::manifest_store::{HandlerManifest, Policies};
    use crate::route_manager::{Method, RouteManagerConfig};
    use crate::tsv::Tsv;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gctx() -> Arc<GlobalContext> {
        Arc::new(GlobalContext::new(InstanceIdentity::new(None, None), serde_json::json!({})))
    }

    fn descriptor(path: &str) -> RequestDescriptor {
        RequestDescriptor {
            request_id: "r1".to_string(),
            path: path.to_string(),
            method: Method::Get,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: serde_json::json!({}),
            auth_context: None,
            client_id: "c1".to_string(),
        }
    }

    fn manifest(handler_id: &str, path: &str, tsv: &Tsv) -> HandlerManifest {
        HandlerManifest {
            handler_id: handler_id.to_string(),
            path: path.to_string(),
            methods: vec!["GET".to_string()],
            version: tsv.clone(),
            request_gtype: None,
            response_gtype: None,
            policies: Policies::default(),
            dependencies: vec![],
            content_hash: "h".to_string(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn dispatch_runs_before_handler_after_in_order() {
        let route_manager = Arc::new(RouteManager::new(RouteManagerConfig::default()));
        let v1 = Tsv::parse("tsv:1000-a-1").unwrap();
        route_manager.register_handler(
            "/p",
            v1.clone(),
            Arc::new(|_, _, _| Box::pin(async { Ok(serde_json::json!({ "ok": true })) })),
            manifest("h1", "/p", &v1),
        );

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hooks = Arc::new(HookOrchestrator::new(None));
        let order2 = order.clone();
        hooks.register_before(Hook::new(
            "b1",
            HookLevel::Global,
            Arc::new(move |_, _| {
                let order2 = order2.clone();
                Box::pin(async move {
                    order2.lock().push("before");
                    Ok(())
                })
            }),
        ));
        let order3 = order.clone();
        hooks.register_after(Hook::new(
            "a1",
            HookLevel::Global,
            Arc::new(move |_, _| {
                let order3 = order3.clone();
                Box::pin(async move {
                    order3.lock().push("after");
                    Ok(())
                })
            }),
        ));

        let dispatcher = Dispatcher::new(route_manager, hooks);
        let outcome = dispatcher.dispatch(descriptor("/p"), gctx(), Arc::new(LocalContext::new(None, "c1"))).await.unwrap();
        assert_eq!(outcome.response["ok"], true);
        assert_eq!(*order.lock(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn failed_before_hook_triggers_compensation_and_skips_handler() {
        let route_manager = Arc::new(RouteManager::new(RouteManagerConfig::default()));
        let v1 = Tsv::parse("tsv:1000-a-1").unwrap();
        let handler_calls = Arc::new(AtomicU32::new(0));
        let handler_calls2 = handler_calls.clone();
        route_manager.register_handler(
            "/p",
            v1.clone(),
            Arc::new(move |_, _, _| {
                let handler_calls2 = handler_calls2.clone();
                Box::pin(async move {
                    handler_calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({}))
                })
            }),
            manifest("h1", "/p", &v1),
        );

        let compensated = Arc::new(AtomicU32::new(0));
        let hooks = Arc::new(HookOrchestrator::new(None));
        hooks.register_before(Hook::new("fails", HookLevel::Global, Arc::new(|_, _| Box::pin(async { Err("boom".to_string()) }))));
        let compensated2 = compensated.clone();
        hooks.register_compensating_action(
            "undo",
            Arc::new(move || {
                let compensated2 = compensated2.clone();
                Box::pin(async move {
                    compensated2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let dispatcher = Dispatcher::new(route_manager, hooks);
        let err = dispatcher.dispatch(descriptor("/p"), gctx(), Arc::new(LocalContext::new(None, "c1"))).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Hook(_)));
        assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
        assert_eq!(compensated.load(Ordering::SeqCst), 1);
    }
}
