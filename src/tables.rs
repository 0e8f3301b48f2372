//! Concurrent routing tables.
//!
//! Three independent maps back every routing decision: subdomain to version, version to
//! revision and revision to backend. Each is a [`DashMap`], so data-plane reads and admin
//! writes interleave freely without losing updates; every mutation is atomic for its key.

use crate::{backend::Backend, error::RouterError, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
};
use tracing::info;

/// The version every fallback chain terminates at.
pub const STABLE_VERSION: &str = "stable";

/// Identifies one of the three routing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    SubdomainVersion,
    VersionRevision,
    RevisionBackend,
}

impl Table {
    pub const ALL: [Table; 3] = [
        Table::SubdomainVersion,
        Table::VersionRevision,
        Table::RevisionBackend,
    ];

    /// Short name used for admin paths, snapshot files and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Table::SubdomainVersion => "sv",
            Table::VersionRevision => "vr",
            Table::RevisionBackend => "rp",
        }
    }

    /// Form field carrying the key.
    pub fn key_field(&self) -> &'static str {
        match self {
            Table::SubdomainVersion => "subdomain",
            Table::VersionRevision => "version",
            Table::RevisionBackend => "revision",
        }
    }

    /// Form field carrying the value.
    pub fn value_field(&self) -> &'static str {
        match self {
            Table::SubdomainVersion => "version",
            Table::VersionRevision => "revision",
            Table::RevisionBackend => "p",
        }
    }

    pub fn snapshot_file(&self) -> String {
        format!("{}.json", self.name())
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared routing state read by the data plane and written by the admin API.
#[derive(Debug, Default)]
pub struct RoutingTables {
    subdomain_versions: DashMap<String, String>,
    version_revisions: DashMap<String, String>,
    revision_backends: DashMap<String, Backend>,
}

impl RoutingTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version_for_subdomain(&self, subdomain: &str) -> Option<String> {
        self.subdomain_versions
            .get(subdomain)
            .map(|entry| entry.value().clone())
    }

    pub fn revision_for_version(&self, version: &str) -> Option<String> {
        self.version_revisions
            .get(version)
            .map(|entry| entry.value().clone())
    }

    pub fn backend_for_revision(&self, revision: &str) -> Option<Backend> {
        self.revision_backends
            .get(revision)
            .map(|entry| entry.value().clone())
    }

    pub fn set_subdomain_version(&self, subdomain: &str, version: &str) {
        self.subdomain_versions
            .insert(subdomain.to_string(), version.to_string());
    }

    pub fn set_version_revision(&self, version: &str, revision: &str) {
        self.version_revisions
            .insert(version.to_string(), revision.to_string());
    }

    /// Register a backend for `revision`. The table is left untouched if `url` is invalid.
    pub fn set_revision_backend(&self, revision: &str, url: &str) -> Result<()> {
        let backend = Backend::new(url)?;
        self.revision_backends.insert(revision.to_string(), backend);
        Ok(())
    }

    /// String view of a single entry; backends read back as their URL.
    pub fn get(&self, table: Table, key: &str) -> Option<String> {
        match table {
            Table::SubdomainVersion => self.version_for_subdomain(key),
            Table::VersionRevision => self.revision_for_version(key),
            Table::RevisionBackend => self
                .backend_for_revision(key)
                .map(|backend| backend.url().to_string()),
        }
    }

    /// Insert or overwrite one entry.
    pub fn set(&self, table: Table, key: &str, value: &str) -> Result<()> {
        match table {
            Table::SubdomainVersion => self.set_subdomain_version(key, value),
            Table::VersionRevision => self.set_version_revision(key, value),
            Table::RevisionBackend => self.set_revision_backend(key, value)?,
        }
        Ok(())
    }

    /// Remove one entry. Returns whether the key was present.
    pub fn delete(&self, table: Table, key: &str) -> bool {
        match table {
            Table::SubdomainVersion => self.subdomain_versions.remove(key).is_some(),
            Table::VersionRevision => self.version_revisions.remove(key).is_some(),
            Table::RevisionBackend => self.revision_backends.remove(key).is_some(),
        }
    }

    /// Point-in-time copy of a table, keys sorted.
    pub fn snapshot(&self, table: Table) -> BTreeMap<String, String> {
        match table {
            Table::SubdomainVersion => collect_strings(&self.subdomain_versions),
            Table::VersionRevision => collect_strings(&self.version_revisions),
            Table::RevisionBackend => self
                .revision_backends
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().url().to_string()))
                .collect(),
        }
    }

    /// Every registered backend, ordered by revision key.
    pub fn backends_by_revision(&self) -> Vec<(String, Backend)> {
        let mut backends: Vec<_> = self
            .revision_backends
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        backends.sort_by(|a, b| a.0.cmp(&b.0));
        backends
    }

    pub fn len(&self, table: Table) -> usize {
        match table {
            Table::SubdomainVersion => self.subdomain_versions.len(),
            Table::VersionRevision => self.version_revisions.len(),
            Table::RevisionBackend => self.revision_backends.len(),
        }
    }

    /// Load all three tables from `sv.json`, `vr.json` and `rp.json` under `dir`.
    ///
    /// The files are read concurrently and every one of them must load; a missing file
    /// or malformed document fails the whole load.
    pub async fn load_snapshot<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        let (subdomain_versions, version_revisions, revision_backends) = tokio::try_join!(
            read_snapshot::<HashMap<String, String>>(dir.join(Table::SubdomainVersion.snapshot_file())),
            read_snapshot::<HashMap<String, String>>(dir.join(Table::VersionRevision.snapshot_file())),
            read_snapshot::<HashMap<String, Backend>>(dir.join(Table::RevisionBackend.snapshot_file())),
        )?;

        let tables = Self {
            subdomain_versions: subdomain_versions.into_iter().collect(),
            version_revisions: version_revisions.into_iter().collect(),
            revision_backends: revision_backends.into_iter().collect(),
        };

        info!(
            "Loaded routing snapshot from {}: {} subdomains, {} versions, {} revisions",
            dir.display(),
            tables.len(Table::SubdomainVersion),
            tables.len(Table::VersionRevision),
            tables.len(Table::RevisionBackend),
        );

        Ok(tables)
    }
}

fn collect_strings(map: &DashMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect()
}

async fn read_snapshot<T: DeserializeOwned>(path: PathBuf) -> Result<T> {
    let content = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RouterError::SnapshotNotFound {
            path: path.display().to_string(),
        },
        _ => RouterError::SnapshotParse {
            path: path.display().to_string(),
            message: e.to_string(),
        },
    })?;

    serde_json::from_str(&content).map_err(|e| RouterError::SnapshotParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_absent_keys_are_not_defaulted() {
        let tables = RoutingTables::new();
        tables.set_version_revision(STABLE_VERSION, "900");

        assert_eq!(tables.revision_for_version("canary"), None);
        assert_eq!(tables.version_for_subdomain("app"), None);
        assert_eq!(tables.backend_for_revision("900"), None);
    }

    #[test]
    fn test_invalid_backend_leaves_table_unchanged() {
        let tables = RoutingTables::new();
        tables.set_revision_backend("900", "http://host-a").unwrap();

        let err = tables.set(Table::RevisionBackend, "900", "::not-a-url::").unwrap_err();
        assert!(matches!(err, RouterError::InvalidBackendUrl { .. }));
        assert_eq!(tables.get(Table::RevisionBackend, "900").as_deref(), Some("http://host-a"));

        assert!(tables.set(Table::RevisionBackend, "901", "garbage").is_err());
        assert_eq!(tables.len(Table::RevisionBackend), 1);
    }

    #[test]
    fn test_set_is_idempotent_and_delete_reports_presence() {
        let tables = RoutingTables::new();
        tables.set(Table::SubdomainVersion, "beta", "canary").unwrap();
        tables.set(Table::SubdomainVersion, "beta", "canary").unwrap();
        assert_eq!(tables.snapshot(Table::SubdomainVersion).len(), 1);

        assert!(tables.delete(Table::SubdomainVersion, "beta"));
        assert!(!tables.delete(Table::SubdomainVersion, "beta"));
    }

    #[test]
    fn test_backends_by_revision_is_sorted() {
        let tables = RoutingTables::new();
        tables.set_revision_backend("b", "http://host-b").unwrap();
        tables.set_revision_backend("c", "http://host-c").unwrap();
        tables.set_revision_backend("a", "http://host-a").unwrap();

        let order: Vec<_> = tables
            .backends_by_revision()
            .into_iter()
            .map(|(revision, _)| revision)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_table_names() {
        for table in Table::ALL {
            assert_eq!(Table::from_name(table.name()), Some(table));
        }
        assert_eq!(Table::from_name("xx"), None);
        assert_eq!(Table::RevisionBackend.value_field(), "p");
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let tables = Arc::new(RoutingTables::new());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let tables = tables.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let key = format!("{}-{}", worker, i);
                        tables.set_version_revision(&key, "900");
                        let _ = tables.revision_for_version(STABLE_VERSION);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tables.len(Table::VersionRevision), 8 * 250);
    }

    #[tokio::test]
    async fn test_load_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sv.json"), r#"{"beta":"canary"}"#).unwrap();
        std::fs::write(dir.path().join("vr.json"), r#"{"stable":"900","canary":"901"}"#).unwrap();
        std::fs::write(
            dir.path().join("rp.json"),
            r#"{"900":"http://host-a","901":"http://host-b"}"#,
        )
        .unwrap();

        let tables = RoutingTables::load_snapshot(dir.path()).await.unwrap();

        assert_eq!(tables.version_for_subdomain("beta").as_deref(), Some("canary"));
        assert_eq!(tables.revision_for_version(STABLE_VERSION).as_deref(), Some("900"));
        assert_eq!(tables.backend_for_revision("901").unwrap().url(), "http://host-b");
    }

    #[tokio::test]
    async fn test_load_snapshot_requires_every_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sv.json"), "{}").unwrap();
        std::fs::write(dir.path().join("vr.json"), "{}").unwrap();

        let err = RoutingTables::load_snapshot(dir.path()).await.unwrap_err();
        assert!(matches!(err, RouterError::SnapshotNotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_snapshot_rejects_bad_backend_url() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sv.json"), "{}").unwrap();
        std::fs::write(dir.path().join("vr.json"), "{}").unwrap();
        std::fs::write(dir.path().join("rp.json"), r#"{"900":"not a url"}"#).unwrap();

        let err = RoutingTables::load_snapshot(dir.path()).await.unwrap_err();
        assert!(matches!(err, RouterError::SnapshotParse { .. }));
    }
}
