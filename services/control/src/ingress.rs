//! Ingress Writer.
//!
//! Renders the active routing records into the tunnel daemon's `config.yml`
//! and swaps it in atomically (write to a sibling temp file, fsync, rename),
//! so the daemon never observes a partial file.
//!
//! Every render reads the active set from the state store inside the write
//! lock; the state store is the source of truth and the file is derived.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::state::{RouteFilter, RoutingRecord, StateStore, StateStoreError};

/// Catch-all service rendered as the last rule.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// Errors from rendering or writing the ingress file.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to render ingress file: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error("invalid ingress document: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

/// One hostname-to-service mapping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IngressEntry {
    pub hostname: String,
    pub service: String,
}

impl From<&RoutingRecord> for IngressEntry {
    fn from(record: &RoutingRecord) -> Self {
        Self {
            hostname: record.fqdn(),
            service: format!("http://{}", record.target_address),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IngressDocument {
    tunnel: String,
    #[serde(rename = "credentials-file")]
    credentials_file: String,
    #[serde(default)]
    ingress: Vec<IngressRule>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    service: String,
}

impl IngressDocument {
    fn validate(&self) -> Result<(), IngressError> {
        let Some((last, rules)) = self.ingress.split_last() else {
            return Err(IngressError::Invalid("no ingress rules".to_string()));
        };

        if last.hostname.is_some() {
            return Err(IngressError::Invalid(
                "last rule must be a catch-all without hostname".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for rule in rules {
            let Some(hostname) = &rule.hostname else {
                return Err(IngressError::Invalid(
                    "catch-all rule must be last".to_string(),
                ));
            };
            if !seen.insert(hostname.as_str()) {
                return Err(IngressError::Invalid(format!(
                    "duplicate hostname {hostname}"
                )));
            }
        }

        Ok(())
    }
}

/// Writes the tunnel daemon's ingress file.
pub struct IngressWriter {
    path: PathBuf,
    tunnel_id: String,
    credentials_file: PathBuf,
    store: Arc<StateStore>,
    write_lock: Mutex<()>,
}

impl IngressWriter {
    pub fn new(
        path: impl Into<PathBuf>,
        tunnel_id: impl Into<String>,
        credentials_file: impl Into<PathBuf>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            path: path.into(),
            tunnel_id: tunnel_id.into(),
            credentials_file: credentials_file.into(),
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling temp file used for the atomic swap.
    pub fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "ingress".to_string());
        self.path.with_file_name(format!(".{name}.tmp"))
    }

    /// Render the given records into a validated YAML document.
    pub fn render(&self, records: &[RoutingRecord]) -> Result<String, IngressError> {
        let mut entries: Vec<IngressEntry> = records.iter().map(IngressEntry::from).collect();
        entries.sort();

        let mut ingress: Vec<IngressRule> = entries
            .into_iter()
            .map(|e| IngressRule {
                hostname: Some(e.hostname),
                service: e.service,
            })
            .collect();
        ingress.push(IngressRule {
            hostname: None,
            service: CATCH_ALL_SERVICE.to_string(),
        });

        let document = IngressDocument {
            tunnel: self.tunnel_id.clone(),
            credentials_file: self.credentials_file.to_string_lossy().to_string(),
            ingress,
        };
        document.validate()?;

        Ok(serde_yaml::to_string(&document)?)
    }

    /// Re-render the file from the current active record set.
    ///
    /// Returns the number of hostname entries written. On failure the
    /// previous file is left untouched.
    pub async fn sync(&self) -> Result<usize, IngressError> {
        let _guard = self.write_lock.lock().await;

        let records = self.store.list_active_routes(&RouteFilter::default())?;
        let content = self.render(&records)?;

        // Blocking file I/O stays off the runtime workers
        let path = self.path.clone();
        let tmp_path = self.temp_path();
        tokio::task::spawn_blocking(move || swap_file(&path, &tmp_path, &content))
            .await
            .map_err(|e| IngressError::Io {
                path: self.path.clone(),
                source: std::io::Error::other(e),
            })??;

        info!(
            path = %self.path.display(),
            entries = records.len(),
            "Ingress file updated"
        );
        Ok(records.len())
    }

    /// Read the hostname entries currently on disk (catch-all excluded).
    ///
    /// A missing file has no entries.
    pub fn read_entries(&self) -> Result<Vec<IngressEntry>, IngressError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(IngressError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let document: IngressDocument = serde_yaml::from_str(&content)?;
        let mut entries: Vec<IngressEntry> = document
            .ingress
            .into_iter()
            .filter_map(|rule| {
                rule.hostname.map(|hostname| IngressEntry {
                    hostname,
                    service: rule.service,
                })
            })
            .collect();
        entries.sort();
        Ok(entries)
    }
}

/// Replace `path` with `content` via a sibling temp file, fsync and rename.
fn swap_file(path: &Path, tmp_path: &Path, content: &str) -> Result<(), IngressError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| IngressError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let result = (|| {
        let mut file = File::create(tmp_path).map_err(io_err(tmp_path))?;
        file.write_all(content.as_bytes())
            .map_err(io_err(tmp_path))?;
        file.sync_all().map_err(io_err(tmp_path))?;
        fs::rename(tmp_path, path).map_err(io_err(path))
    })();

    if result.is_err() && tmp_path.is_file() {
        let _ = fs::remove_file(tmp_path);
    }
    result?;

    // Persist the rename itself
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    debug!(path = %path.display(), bytes = content.len(), "Swapped ingress file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NewRoute, TargetKind};

    fn writer(dir: &Path, store: Arc<StateStore>) -> IngressWriter {
        IngressWriter::new(
            dir.join("config.yml"),
            "tunnel-1",
            "/etc/cloudflared/tunnel-1.json",
            store,
        )
    }

    fn add_route(store: &StateStore, hostname: &str, kind: TargetKind, address: &str) {
        store
            .insert_route(&NewRoute {
                hostname: hostname.to_string(),
                domain: "example.com".to_string(),
                owning_workload: "teamA".to_string(),
                target_port: 5000,
                target_kind: kind,
                target_address: address.to_string(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_render_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        add_route(&store, "app", TargetKind::Container, "web:5073");
        add_route(&store, "api", TargetKind::Host, "localhost:5000");

        let writer = writer(dir.path(), store);
        assert_eq!(writer.sync().await.unwrap(), 2);

        let content = fs::read_to_string(writer.path()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&content).unwrap();

        assert_eq!(doc["tunnel"], "tunnel-1");
        assert_eq!(doc["credentials-file"], "/etc/cloudflared/tunnel-1.json");
        let rules = doc["ingress"].as_sequence().unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0]["hostname"], "api.example.com");
        assert_eq!(rules[0]["service"], "http://localhost:5000");
        assert_eq!(rules[1]["hostname"], "app.example.com");
        assert_eq!(rules[1]["service"], "http://web:5073");
        assert!(rules[2].get("hostname").is_none());
        assert_eq!(rules[2]["service"], CATCH_ALL_SERVICE);
    }

    #[tokio::test]
    async fn test_empty_set_renders_catch_all_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let writer = writer(dir.path(), store);

        assert_eq!(writer.sync().await.unwrap(), 0);
        assert!(writer.read_entries().unwrap().is_empty());
        assert!(fs::read_to_string(writer.path())
            .unwrap()
            .contains(CATCH_ALL_SERVICE));
    }

    #[tokio::test]
    async fn test_read_entries_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        add_route(&store, "api", TargetKind::Host, "localhost:5000");
        let writer = writer(dir.path(), store);
        writer.sync().await.unwrap();

        assert_eq!(
            writer.read_entries().unwrap(),
            vec![IngressEntry {
                hostname: "api.example.com".to_string(),
                service: "http://localhost:5000".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_write_leaves_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        add_route(&store, "api", TargetKind::Host, "localhost:5000");
        let writer = writer(dir.path(), store.clone());
        writer.sync().await.unwrap();
        let before = fs::read(writer.path()).unwrap();

        // A directory where the temp file should go makes the write fail
        fs::create_dir(writer.temp_path()).unwrap();
        add_route(&store, "app", TargetKind::Container, "web:5073");

        let err = writer.sync().await.unwrap_err();
        assert!(matches!(err, IngressError::Io { .. }));
        assert_eq!(fs::read(writer.path()).unwrap(), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_syncs_leave_a_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        for label in ["a", "b", "c", "d"] {
            add_route(&store, label, TargetKind::Host, "localhost:5000");
        }
        let writer = Arc::new(writer(dir.path(), store));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let writer = writer.clone();
                tokio::spawn(async move { writer.sync().await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 4);
        }

        assert_eq!(writer.read_entries().unwrap().len(), 4);
        assert!(!writer.temp_path().exists());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_misplaced_catch_all() {
        let rule = |hostname: Option<&str>| IngressRule {
            hostname: hostname.map(str::to_string),
            service: "http://localhost:1".to_string(),
        };
        let doc = |ingress| IngressDocument {
            tunnel: "t".to_string(),
            credentials_file: "c".to_string(),
            ingress,
        };

        assert!(doc(vec![rule(Some("a")), rule(None)]).validate().is_ok());
        assert!(doc(vec![rule(Some("a")), rule(Some("a")), rule(None)])
            .validate()
            .is_err());
        assert!(doc(vec![rule(None), rule(Some("a")), rule(None)])
            .validate()
            .is_err());
        assert!(doc(vec![rule(Some("a"))]).validate().is_err());
        assert!(doc(vec![]).validate().is_err());
    }
}
