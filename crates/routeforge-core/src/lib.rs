//! RouteForge core: version-aware, policy-enforced request dispatch with
//! asynchronous fan-out.
//!
//! Three tightly coupled subsystems:
//!
//! - [`route_manager`] (component D) resolves a request to a handler
//!   version, enforces health/rate-limit/auth policy, and bridges payloads
//!   across version boundaries via [`transformer`] (component B) and
//!   [`version_registry`] (component A), backed by [`manifest_store`]
//!   (component C).
//! - [`queue_fabric`] (component E) is an in-process topic-based pub/sub
//!   bus with priority ordering, backpressure, and delivery semantics.
//! - [`hooks`] (component F) runs before/after/catch pipelines with
//!   timeout, retry, and compensating actions around each handler.
//!
//! [`context`] (component G) carries the process-lifetime and
//! request-lifetime state these subsystems thread through.

#![forbid(unsafe_code)]

pub mod cache;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod gtype;
pub mod hooks;
pub mod manifest_store;
pub mod queue_fabric;
pub mod route_manager;
pub mod transformer;
pub mod tsv;
pub mod version_registry;

pub use context::{AuthContext, GlobalContext, InstanceIdentity, LocalContext, Phase, RequestLifecycle};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{Error, Result};
pub use hooks::{Hook, HookLevel, HookOrchestrator, LifecycleEvent};
pub use manifest_store::{HandlerManifest, ManifestStore, Policies, RateLimitPolicy};
pub use queue_fabric::{DeliverySemantics, QueueFabric, QueuedMessage};
pub use route_manager::{
    HandlerInstance, HealthStatus, Method, RequestDescriptor, RouteManager, RouteManagerConfig, RoutingResult,
};
pub use transformer::{TransformOutcome, TransformerEngine, TransformerPair};
pub use tsv::Tsv;
pub use version_registry::{VersionRecord, VersionRegistry, VersionStatus};
