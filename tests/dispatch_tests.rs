//! End-to-end coverage of the HTTP edge: a registered handler is reachable
//! through the axum router, and routing failures surface as the mapped
//! HTTP status instead of a panic.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use routeforge::gateway::router::{build_router, AppState};
use routeforge_core::manifest_store::{HandlerManifest, Policies};
use routeforge_core::tsv::Tsv;
use routeforge_core::{Dispatcher, GlobalContext, HookOrchestrator, InstanceIdentity, RouteManager, RouteManagerConfig};
use tower::ServiceExt;

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

fn app_state() -> AppState {
    let route_manager = Arc::new(RouteManager::new(RouteManagerConfig::default()));
    let v1 = Tsv::parse("tsv:1000-a-1").unwrap();
    route_manager.register_handler(
        "/echo",
        v1.clone(),
        Arc::new(|request, _gctx, _lctx| {
            Box::pin(async move { Ok(serde_json::json!({ "echo": request.body })) })
        }),
        manifest("echo-handler", "/echo", &v1),
    );

    let dispatcher = Arc::new(Dispatcher::new(route_manager, Arc::new(HookOrchestrator::new(None))));
    let global = Arc::new(GlobalContext::new(InstanceIdentity::new(None, None), serde_json::json!({})));
    AppState { dispatcher, global }
}

#[tokio::test]
async fn registered_handler_is_reachable_and_echoes_body() {
    let app = build_router(app_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo")
                .header("content-type", "application/json")
                .header("x-request-id", "req-1")
                .body(Body::from(r#"{"hello":"world"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["echo"]["hello"], "world");
}

#[tokio::test]
async fn unknown_path_maps_to_404() {
    let app = build_router(app_state());
    let response = app
        .oneshot(Request::builder().method("GET").uri("/missing").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_json_body_maps_to_400() {
    let app = build_router(app_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo")
                .header("content-type", "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

