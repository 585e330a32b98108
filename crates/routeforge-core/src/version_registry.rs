//! Component A — Version Registry (spec §4.A).
//!
//! Stores, per route path, an ordered sequence of [`VersionRecord`]s keyed by
//! [`Tsv`], and a reverse map `TSV -> (path, record)`. Grounded on the
//! `Manager` shape in the boilmaster `version-manager.rs` reference (a
//! `RwLock`-guarded map of versions plus a name index) but generalized to
//! the spec's per-path ordering and `hot/warm/cold` status instead of a
//! single flat version list.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutingError, RoutingErrorCode};
use crate::tsv::Tsv;

/// Lifecycle status of a registered version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    /// Freshly registered / actively serving.
    Hot,
    /// Still servable but not the default resolution target.
    Warm,
    /// Excluded from `resolveLatest`.
    Cold,
}

/// A version record as stored in the registry (spec §3 `Version Record`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    /// The version identifier.
    pub tsv: Tsv,
    /// Content hash of the registered handler/manifest.
    pub hash: String,
    /// Lifecycle status.
    pub status: VersionStatus,
    /// Number of `recordRequest` calls observed for this TSV.
    pub request_count: u64,
    /// Unix-ms of the last recorded request, `None` until the first.
    pub last_accessed: Option<u64>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Unix-ms this record was first created (preserved across replace-by-key).
    pub created_at: u64,
}

struct PathEntry {
    /// Insertion-order-independent; always kept sorted by `Tsv` ordering.
    records: Vec<VersionRecord>,
}

/// The Version Registry (Component A).
pub struct VersionRegistry {
    by_path: RwLock<HashMap<String, PathEntry>>,
    /// Reverse index: TSV string -> (path, index into that path's `records`).
    by_tsv: RwLock<HashMap<String, String>>,
}

impl Default for VersionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_path: RwLock::new(HashMap::new()),
            by_tsv: RwLock::new(HashMap::new()),
        }
    }

    /// `registerVersion(path, tsv, meta)` — idempotent by `(path, tsv)`;
    /// later registrations of the same key replace metadata but preserve
    /// `created_at`.
    pub fn register_version(
        &self,
        path: &str,
        tsv: Tsv,
        hash: String,
        status: VersionStatus,
        tags: Vec<String>,
    ) {
        let now = now_ms();
        let mut by_path = self.by_path.write();
        let entry = by_path.entry(path.to_string()).or_insert_with(|| PathEntry {
            records: Vec::new(),
        });

        if let Some(pos) = entry.records.iter().position(|r| r.tsv == tsv) {
            let created_at = entry.records[pos].created_at;
            entry.records[pos] = VersionRecord {
                tsv: tsv.clone(),
                hash,
                status,
                request_count: entry.records[pos].request_count,
                last_accessed: entry.records[pos].last_accessed,
                tags,
                created_at,
            };
        } else {
            entry.records.push(VersionRecord {
                tsv: tsv.clone(),
                hash,
                status,
                request_count: 0,
                last_accessed: None,
                tags,
                created_at: now,
            });
            entry.records.sort_by(|a, b| a.tsv.cmp(&b.tsv));
        }

        drop(by_path);
        self.by_tsv.write().insert(tsv.as_str().to_string(), path.to_string());
    }

    /// `getVersions(path) -> [records]` sorted by embedded timestamp ascending.
    #[must_use]
    pub fn get_versions(&self, path: &str) -> Vec<VersionRecord> {
        self.by_path
            .read()
            .get(path)
            .map(|e| e.records.clone())
            .unwrap_or_default()
    }

    /// `recordRequest(tsv)` — increments counter and updates `lastAccessed`.
    pub fn record_request(&self, tsv: &Tsv) {
        let by_tsv = self.by_tsv.read();
        let Some(path) = by_tsv.get(tsv.as_str()) else {
            return;
        };
        let path = path.clone();
        drop(by_tsv);

        let mut by_path = self.by_path.write();
        if let Some(entry) = by_path.get_mut(&path) {
            if let Some(record) = entry.records.iter_mut().find(|r| &r.tsv == tsv) {
                record.request_count += 1;
                record.last_accessed = Some(now_ms());
            }
        }
    }

    /// `resolveLatest(path) -> TSV` with the greatest embedded timestamp
    /// among records whose status != cold.
    pub fn resolve_latest(&self, path: &str) -> Result<Tsv> {
        self.by_path
            .read()
            .get(path)
            .and_then(|e| {
                e.records
                    .iter()
                    .filter(|r| r.status != VersionStatus::Cold)
                    .max_by(|a, b| a.tsv.cmp(&b.tsv))
                    .map(|r| r.tsv.clone())
            })
            .ok_or_else(|| {
                RoutingError::new(RoutingErrorCode::NoVersion, "no servable version registered")
                    .with_details(serde_json::json!({ "path": path }))
                    .into()
            })
    }

    /// Update the status of a specific `(path, tsv)` record, if it exists.
    pub fn set_status(&self, path: &str, tsv: &Tsv, status: VersionStatus) {
        if let Some(entry) = self.by_path.write().get_mut(path) {
            if let Some(record) = entry.records.iter_mut().find(|r| &r.tsv == tsv) {
                record.status = status;
            }
        }
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

    fn tsv(ms: u64, seq: u64) -> Tsv {
        Tsv::parse(format!("tsv:{ms}-abc-{seq}")).unwrap()
    }

    #[test]
    fn register_is_idempotent_by_path_and_tsv() {
        let reg = VersionRegistry::new();
        let v = tsv(1000, 1);
        reg.register_version("/users/:id", v.clone(), "h1".into(), VersionStatus::Hot, vec![]);
        reg.register_version("/users/:id", v.clone(), "h2".into(), VersionStatus::Warm, vec![]);

        let versions = reg.get_versions("/users/:id");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].hash, "h2");
        assert_eq!(versions[0].status, VersionStatus::Warm);
    }

    #[test]
    fn get_versions_sorted_ascending_by_timestamp() {
        let reg = VersionRegistry::new();
        reg.register_version("/p", tsv(2000, 1), "h".into(), VersionStatus::Hot, vec![]);
        reg.register_version("/p", tsv(1000, 1), "h".into(), VersionStatus::Hot, vec![]);
        let versions = reg.get_versions("/p");
        assert_eq!(versions[0].tsv.timestamp_ms(), 1000);
        assert_eq!(versions[1].tsv.timestamp_ms(), 2000);
    }

    #[test]
    fn resolve_latest_ignores_cold_versions() {
        let reg = VersionRegistry::new();
        reg.register_version("/p", tsv(1000, 1), "h".into(), VersionStatus::Hot, vec![]);
        reg.register_version("/p", tsv(2000, 1), "h".into(), VersionStatus::Cold, vec![]);
        let latest = reg.resolve_latest("/p").unwrap();
        assert_eq!(latest.timestamp_ms(), 1000);
    }

    #[test]
    fn resolve_latest_errors_when_no_versions() {
        let reg = VersionRegistry::new();
        let err = reg.resolve_latest("/missing").unwrap_err();
        match err {
            crate::error::Error::Routing(e) => assert_eq!(e.code, RoutingErrorCode::NoVersion),
            _ => panic!("expected routing error"),
        }
    }

    #[test]
    fn record_request_updates_count_and_last_accessed() {
        let reg = VersionRegistry::new();
        let v = tsv(1000, 1);
        reg.register_version("/p", v.clone(), "h".into(), VersionStatus::Hot, vec![]);
        reg.record_request(&v);
        reg.record_request(&v);
        let versions = reg.get_versions("/p");
        assert_eq!(versions[0].request_count, 2);
        assert!(versions[0].last_accessed.is_some());
    }
}
