//! HTTP-to-dispatch translation.
//!
//! Builds a `routeforge_core::RequestDescriptor` and `LocalContext` from an
//! inbound axum request, drives the shared [`Dispatcher`], and maps the
//! core's [`RoutingErrorCode`] onto HTTP status codes — that mapping lives
//! here, outside the core, per the headers recognised in spec §6.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::any;
use axum::Router;
use routeforge_core::{AuthContext, Dispatcher, GlobalContext, LocalContext, Method, RequestDescriptor};
use serde_json::Value;
use uuid::Uuid;

use super::trace;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Composed Route Manager + Hook Orchestrator.
    pub dispatcher: Arc<Dispatcher>,
    /// Process-lifetime context shared by all requests.
    pub global: Arc<GlobalContext>,
}

/// Build the router: a single catch-all route, since path resolution is the
/// Route Manager's job, not axum's.
pub fn build_router(state: AppState) -> Router {
    Router::new().route("/{*path}", any(dispatch)).with_state(state)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn method_from(method: &axum::http::Method) -> Option<Method> {
    match method.as_str() {
        "GET" => Some(Method::Get),
        "POST" => Some(Method::Post),
        "PUT" => Some(Method::Put),
        "PATCH" => Some(Method::Patch),
        "DELETE" => Some(Method::Delete),
        _ => None,
    }
}

fn many_map(pairs: impl Iterator<Item = (String, String)>) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in pairs {
        map.entry(k).or_default().push(v);
    }
    map
}

async fn dispatch(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query_pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    method: axum::http::Method,
    body: Bytes,
) -> Response {
    let Some(method) = method_from(&method) else {
        return (StatusCode::METHOD_NOT_ALLOWED, "method not supported").into_response();
    };

    let request_id = header_str(&headers, "x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let trace_id = header_str(&headers, "x-trace-id").unwrap_or_else(trace::generate);
    let parent_span_id = header_str(&headers, "x-parent-span-id");
    let session_id = header_str(&headers, "x-session-id");
    let user_id = header_str(&headers, "x-user-id");
    let tenant_id = header_str(&headers, "x-tenant-id");
    let client_id = user_id.clone().or_else(|| session_id.clone()).unwrap_or_else(|| "anonymous".to_string());

    let body: Value = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => return (StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}")).into_response(),
        }
    };

    let auth_context = user_id.clone().map(|user_id| AuthContext {
        user_id: Some(user_id),
        roles: Vec::new(),
        token: None,
    });

    let header_pairs = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())));
    let descriptor = RequestDescriptor {
        request_id: request_id.clone(),
        path: format!("/{path}"),
        method,
        headers: many_map(header_pairs),
        query: many_map(query_pairs.into_iter()),
        body,
        auth_context,
        client_id,
    };

    let mut refs = HashMap::new();
    if let Some(session_id) = session_id {
        refs.insert("sessionId".to_string(), session_id);
    }
    if let Some(tenant_id) = tenant_id {
        refs.insert("tenantId".to_string(), tenant_id);
    }
    let mut lctx = LocalContext::new(Some(request_id), descriptor.client_id.clone());
    lctx.trace_id = Some(trace_id.clone());
    lctx.parent_span_id = parent_span_id;
    lctx.refs = refs;
    let lctx = Arc::new(lctx);

    let outcome = trace::with_trace_id(trace_id, state.dispatcher.dispatch(descriptor, state.global.clone(), lctx)).await;
    match outcome {
        Ok(outcome) => Json(outcome.response).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &routeforge_core::Error) -> Response {
    use routeforge_core::error::{Error as CoreError, RoutingErrorCode};

    let (status, body) = match err {
        CoreError::Routing(routing) => {
            let status = match routing.code() {
                RoutingErrorCode::NoHandler | RoutingErrorCode::NoVersion => StatusCode::NOT_FOUND,
                RoutingErrorCode::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
                RoutingErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                RoutingErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            };
            (status, serde_json::json!({ "code": routing.code().as_str(), "message": routing.message, "details": routing.details }))
        }
        CoreError::Validation(message) => {
            (StatusCode::BAD_REQUEST, serde_json::json!({ "code": "VALIDATION_ERROR", "message": message }))
        }
        CoreError::Hook(hook_err) => {
            (StatusCode::GATEWAY_TIMEOUT, serde_json::json!({ "code": "HOOK_ERROR", "message": hook_err.to_string() }))
        }
        CoreError::Transform(transform_err) => {
            (StatusCode::BAD_GATEWAY, serde_json::json!({ "code": "TRANSFORM_ERROR", "message": transform_err.to_string() }))
        }
        CoreError::Queue(queue_err) => {
            (StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({ "code": "QUEUE_ERROR", "message": queue_err.to_string() }))
        }
        CoreError::Handler(message) => {
            (StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({ "code": "HANDLER_ERROR", "message": message }))
        }
        CoreError::Configuration(message) => {
            (StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({ "code": "CONFIGURATION_ERROR", "message": message }))
        }
    };

    (status, Json(body)).into_response()
}
