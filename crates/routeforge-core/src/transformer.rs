//! Component B — Transformer Engine (spec §4.B).
//!
//! Stores `(fromTSV, toTSV) -> pair` and composes chains across a version
//! graph. The per-hop transform functions are plain closures over
//! `serde_json::Value`, mirroring the "payload is bytes/JSON at fabric
//! level" re-architecture note in spec §9 — no reflection, no prototype
//! mutation, just a typed dispatch table keyed by `(Tsv, Tsv)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::TransformError;
use crate::tsv::Tsv;

/// Maximum hops a single chain may traverse.
pub const MAX_HOPS: usize = 10;
/// Per-step timeout ceiling.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A single-hop transform function.
pub type TransformFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// A registered pair of transforms bridging two adjacent versions (spec §3
/// `Transformer Pair`).
#[derive(Clone)]
pub struct TransformerPair {
    /// Source version of the forward direction.
    pub from_tsv: Tsv,
    /// Destination version of the forward direction.
    pub to_tsv: Tsv,
    /// Forward request transform (`from -> to`).
    pub transform_request: Option<TransformFn>,
    /// Forward response transform (`from -> to`).
    pub transform_response: Option<TransformFn>,
    /// Reverse request transform (`to -> from`).
    pub reverse_request: Option<TransformFn>,
    /// Reverse response transform (`to -> from`).
    pub reverse_response: Option<TransformFn>,
}

/// Outcome of a chain application (spec §4.B step 5).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransformOutcome {
    /// Whether every hop in the chain applied successfully.
    pub success: bool,
    /// The transformed payload (unchanged from input if `success == false`).
    pub data: Value,
    /// The versions the chain actually stepped through, in traversal order.
    pub transformed_versions: Vec<String>,
    /// Number of hops applied.
    pub chain_length: usize,
    /// The error, if `success == false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Component B.
#[derive(Default)]
pub struct TransformerEngine {
    pairs: RwLock<HashMap<(String, String), TransformerPair>>,
}

impl TransformerEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `registerTransformer(pair)`.
    pub fn register_transformer(&self, pair: TransformerPair) {
        let key = (pair.from_tsv.as_str().to_string(), pair.to_tsv.as_str().to_string());
        self.pairs.write().insert(key, pair);
    }

    fn pair_for(&self, from: &Tsv, to: &Tsv) -> Option<TransformerPair> {
        self.pairs
            .read()
            .get(&(from.as_str().to_string(), to.as_str().to_string()))
            .cloned()
    }

    /// Apply a request-transform chain bridging `src_tsv` to `dst_tsv` across
    /// `versions` (spec §4.B algorithm, steps 1-5).
    pub async fn transform_request(
        &self,
        data: Value,
        src_tsv: &Tsv,
        dst_tsv: &Tsv,
        versions: &[Tsv],
    ) -> TransformOutcome {
        self.run_chain(data, src_tsv, dst_tsv, versions, Direction::Request).await
    }

    /// Apply a response-transform chain (same composition rules, response
    /// functions) — used to bridge the handler's response back down to the
    /// client's native version.
    pub async fn transform_response(
        &self,
        data: Value,
        src_tsv: &Tsv,
        dst_tsv: &Tsv,
        versions: &[Tsv],
    ) -> TransformOutcome {
        self.run_chain(data, src_tsv, dst_tsv, versions, Direction::Response).await
    }

    async fn run_chain(
        &self,
        mut data: Value,
        src_tsv: &Tsv,
        dst_tsv: &Tsv,
        versions: &[Tsv],
        direction: Direction,
    ) -> TransformOutcome {
        let mut sorted: Vec<Tsv> = versions.to_vec();
        sorted.sort();

        let src_pos = sorted.iter().position(|v| v == src_tsv);
        let dst_pos = sorted.iter().position(|v| v == dst_tsv);
        let (Some(src_pos), Some(dst_pos)) = (src_pos, dst_pos) else {
            let err = TransformError::MissingHop {
                from: src_tsv.as_str().to_string(),
                to: dst_tsv.as_str().to_string(),
            };
            return TransformOutcome {
                success: false,
                data,
                transformed_versions: vec![],
                chain_length: 0,
                error: Some(err.to_string()),
            };
        };

        let hop_indices: Vec<usize> = if src_pos < dst_pos {
            (src_pos..dst_pos).collect()
        } else {
            (dst_pos..src_pos).rev().collect()
        };

        if hop_indices.len() > MAX_HOPS {
            let err = TransformError::TooManyHops(hop_indices.len());
            return TransformOutcome {
                success: false,
                data,
                transformed_versions: vec![],
                chain_length: 0,
                error: Some(err.to_string()),
            };
        }

        let forward = src_pos < dst_pos;
        let mut transformed_versions = Vec::with_capacity(hop_indices.len());

        for idx in hop_indices {
            let (from, to) = if forward {
                (&sorted[idx], &sorted[idx + 1])
            } else {
                (&sorted[idx + 1], &sorted[idx])
            };

            let Some(pair) = self.pair_for(from, to) else {
                let err = TransformError::MissingHop {
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                };
                return TransformOutcome {
                    success: false,
                    data,
                    transformed_versions,
                    chain_length: 0,
                    error: Some(err.to_string()),
                };
            };

            let step_fn = if forward {
                match direction {
                    Direction::Request => pair.transform_request.clone(),
                    Direction::Response => pair.transform_response.clone(),
                }
            } else {
                match direction {
                    Direction::Request => pair.reverse_request.clone(),
                    Direction::Response => pair.reverse_response.clone(),
                }
            };

            let Some(step_fn) = step_fn else {
                let err = TransformError::MissingHop {
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                };
                return TransformOutcome {
                    success: false,
                    data,
                    transformed_versions,
                    chain_length: 0,
                    error: Some(err.to_string()),
                };
            };

            let step_input = data.clone();
            let step_result = tokio::time::timeout(STEP_TIMEOUT, tokio::task::spawn_blocking(move || step_fn(step_input))).await;

            match step_result {
                Ok(Ok(Ok(next))) => {
                    data = next;
                    transformed_versions.push(if forward { to.as_str().to_string() } else { from.as_str().to_string() });
                }
                Ok(Ok(Err(message))) => {
                    let err = TransformError::StepFailed(message);
                    return TransformOutcome {
                        success: false,
                        data,
                        transformed_versions,
                        chain_length: 0,
                        error: Some(err.to_string()),
                    };
                }
                Ok(Err(join_err)) => {
                    let err = TransformError::StepFailed(join_err.to_string());
                    return TransformOutcome {
                        success: false,
                        data,
                        transformed_versions,
                        chain_length: 0,
                        error: Some(err.to_string()),
                    };
                }
                Err(_elapsed) => {
                    let err = TransformError::StepTimeout(STEP_TIMEOUT);
                    return TransformOutcome {
                        success: false,
                        data,
                        transformed_versions,
                        chain_length: 0,
                        error: Some(err.to_string()),
                    };
                }
            }
        }

        let chain_length = transformed_versions.len();
        TransformOutcome {
            success: true,
            data,
            transformed_versions,
            chain_length,
            error: None,
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Request,
    Response,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsv(ms: u64) -> Tsv {
        Tsv::parse(format!("tsv:{ms}-h-1")).unwrap()
    }

    fn set_step(data: Value, key: &str) -> Value {
        let mut obj = data.as_object().cloned().unwrap_or_default();
        let existing = obj.get("step").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let next = if existing.is_empty() {
            key.to_string()
        } else {
            format!("{existing},{key}")
        };
        obj.insert("step".to_string(), Value::String(next));
        Value::Object(obj)
    }

    #[tokio::test]
    async fn s3_transformer_chain_applies_in_order() {
        let engine = TransformerEngine::new();
        let (v1, v2, v3) = (tsv(1000), tsv(2000), tsv(3000));

        engine.register_transformer(TransformerPair {
            from_tsv: v1.clone(),
            to_tsv: v2.clone(),
            transform_request: Some(Arc::new(|d| Ok(set_step(d, "a")))),
            transform_response: None,
            reverse_request: None,
            reverse_response: None,
        });
        engine.register_transformer(TransformerPair {
            from_tsv: v2.clone(),
            to_tsv: v3.clone(),
            transform_request: Some(Arc::new(|d| Ok(set_step(d, "b")))),
            transform_response: None,
            reverse_request: None,
            reverse_response: None,
        });

        let outcome = engine
            .transform_request(serde_json::json!({}), &v1, &v3, &[v1.clone(), v2.clone(), v3.clone()])
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.data["step"], "a,b");
        assert_eq!(outcome.chain_length, 2);
        assert_eq!(outcome.transformed_versions, vec![v2.as_str(), v3.as_str()]);
    }

    #[tokio::test]
    async fn missing_hop_fails_the_whole_chain() {
        let engine = TransformerEngine::new();
        let (v1, v2, v3) = (tsv(1000), tsv(2000), tsv(3000));
        engine.register_transformer(TransformerPair {
            from_tsv: v1.clone(),
            to_tsv: v2.clone(),
            transform_request: Some(Arc::new(|d| Ok(set_step(d, "a")))),
            transform_response: None,
            reverse_request: None,
            reverse_response: None,
        });
        // v2 -> v3 intentionally missing.
        let outcome = engine
            .transform_request(serde_json::json!({}), &v1, &v3, &[v1.clone(), v2, v3.clone()])
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no transformer"));
    }

    #[tokio::test]
    async fn reverse_direction_walks_downward() {
        let engine = TransformerEngine::new();
        let (v1, v2) = (tsv(1000), tsv(2000));
        engine.register_transformer(TransformerPair {
            from_tsv: v1.clone(),
            to_tsv: v2.clone(),
            transform_request: Some(Arc::new(|d| Ok(set_step(d, "fwd")))),
            transform_response: None,
            reverse_request: Some(Arc::new(|d| Ok(set_step(d, "rev")))),
            reverse_response: None,
        });
        let outcome = engine
            .transform_request(serde_json::json!({}), &v2, &v1, &[v1.clone(), v2.clone()])
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.data["step"], "rev");
    }

    #[tokio::test]
    async fn too_many_hops_rejected() {
        let engine = TransformerEngine::new();
        let versions: Vec<Tsv> = (0..12).map(|i| tsv(1000 + i)).collect();
        let outcome = engine
            .transform_request(serde_json::json!({}), &versions[0], &versions[11], &versions)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("max hops"));
    }

    #[tokio::test]
    async fn step_exceeding_ceiling_times_out() {
        let engine = TransformerEngine::new();
        let (v1, v2) = (tsv(1000), tsv(2000));
        engine.register_transformer(TransformerPair {
            from_tsv: v1.clone(),
            to_tsv: v2.clone(),
            transform_request: Some(Arc::new(|d| {
                std::thread::sleep(STEP_TIMEOUT + Duration::from_millis(50));
                Ok(d)
            })),
            transform_response: None,
            reverse_request: None,
            reverse_response: None,
        });
        let outcome = tokio::time::timeout(
            STEP_TIMEOUT + Duration::from_secs(1),
            engine.transform_request(serde_json::json!({}), &v1, &v2, &[v1.clone(), v2.clone()]),
        )
        .await
        .expect("test itself must not time out");
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }
}
