//! Component C — Manifest Store (spec §4.C).
//!
//! An index of five maps. Grounded on the `DashMap`-per-concern style used
//! throughout the reference gateway's `cache.rs`/`transition.rs` rather than
//! one lock guarding everything, since the five maps have independent write
//! patterns (manifests are written once per registration, gtypes rarely
//! change, version graphs are read far more than written).

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::gtype::GType;
use crate::transformer::TransformerPair;
use crate::tsv::Tsv;

/// Declared policies on a handler manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policies {
    /// Roles required to invoke this handler; empty means no auth gate.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Optional rate limit applied per `(handlerId, clientId)`.
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
}

/// A handler's declared rate limit (spec §4.D step 4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Max requests per window.
    pub limit: u64,
    /// Window size in milliseconds.
    pub window_ms: u64,
}

/// Handler Manifest (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerManifest {
    /// Stable identifier for the handler across versions.
    pub handler_id: String,
    /// Route path.
    pub path: String,
    /// HTTP methods this handler answers.
    pub methods: Vec<String>,
    /// The version this manifest describes.
    pub version: Tsv,
    /// GType ref for the request body, if validated.
    pub request_gtype: Option<String>,
    /// GType ref for the response body, if validated.
    pub response_gtype: Option<String>,
    /// Declared policies.
    #[serde(default)]
    pub policies: Policies,
    /// Other handler ids this one depends on (informational).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Content hash for cache invalidation / Version Registry tagging.
    pub content_hash: String,
    /// Unix-ms creation time.
    pub created_at: u64,
}

/// Component C: five independent maps, keyed as specified.
#[derive(Default)]
pub struct ManifestStore {
    manifests: DashMap<(String, String), Arc<HandlerManifest>>,
    gtypes: DashMap<String, Arc<GType>>,
    transformers: DashMap<String, Arc<TransformerPair>>,
    version_graphs: DashMap<String, Vec<Tsv>>,
    timescape: DashMap<(String, String), serde_json::Value>,
}

impl ManifestStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a manifest; a later store with an equal `(handlerId, version)`
    /// key replaces the prior one.
    pub fn put_manifest(&self, manifest: HandlerManifest) {
        let key = (manifest.handler_id.clone(), manifest.version.as_str().to_string());
        let mut graph = self.version_graphs.entry(manifest.handler_id.clone()).or_default();
        if !graph.iter().any(|t| t == &manifest.version) {
            graph.push(manifest.version.clone());
            graph.sort();
        }
        drop(graph);
        self.manifests.insert(key, Arc::new(manifest));
    }

    /// `getManifest(id, version?)`. When `version` is `None`, returns the
    /// record with the maximum `createdAt` among all versions of `id`.
    #[must_use]
    pub fn get_manifest(&self, handler_id: &str, version: Option<&Tsv>) -> Option<Arc<HandlerManifest>> {
        match version {
            Some(v) => self
                .manifests
                .get(&(handler_id.to_string(), v.as_str().to_string()))
                .map(|e| e.clone()),
            None => self
                .manifests
                .iter()
                .filter(|e| e.key().0 == handler_id)
                .max_by_key(|e| e.value().created_at)
                .map(|e| e.value().clone()),
        }
    }

    /// Store a GType schema by ref.
    pub fn put_gtype(&self, gtype_ref: impl Into<String>, schema: GType) {
        self.gtypes.insert(gtype_ref.into(), Arc::new(schema));
    }

    /// Fetch a GType schema by ref.
    #[must_use]
    pub fn get_gtype(&self, gtype_ref: &str) -> Option<Arc<GType>> {
        self.gtypes.get(gtype_ref).map(|e| e.clone())
    }

    /// Store a transformer pair by an arbitrary caller-chosen id.
    pub fn put_transformer(&self, id: impl Into<String>, pair: TransformerPair) {
        self.transformers.insert(id.into(), Arc::new(pair));
    }

    /// Fetch a transformer pair by id.
    #[must_use]
    pub fn get_transformer(&self, id: &str) -> Option<Arc<TransformerPair>> {
        self.transformers.get(id).map(|e| e.clone())
    }

    /// The ordered version graph for a handler id.
    #[must_use]
    pub fn version_graph(&self, handler_id: &str) -> Vec<Tsv> {
        self.version_graphs.get(handler_id).map(|g| g.clone()).unwrap_or_default()
    }

    /// Store Timescape metadata for `(handlerId, version)`.
    pub fn put_timescape(&self, handler_id: impl Into<String>, version: impl Into<String>, meta: serde_json::Value) {
        self.timescape.insert((handler_id.into(), version.into()), meta);
    }

    /// Fetch Timescape metadata for `(handlerId, version)`.
    #[must_use]
    pub fn get_timescape(&self, handler_id: &str, version: &str) -> Option<serde_json::Value> {
        self.timescape.get(&(handler_id.to_string(), version.to_string())).map(|e| e.clone())
    }
}
