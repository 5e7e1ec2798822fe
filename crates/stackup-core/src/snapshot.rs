//! On-disk ConfigSnapshot store.
//!
//! Layout:
//!   .stackup/snapshots/<component>/
//!     0000000007-1718000000000.blob   raw configuration bytes
//!     0000000007-1718000000000.json   metadata, written last
//!
//! The zero-padded `<run_seq>-<millis>` stem makes lexical order equal
//! chronological order. A metadata file is only written after its blob, so a
//! crash mid-write never produces a snapshot that points at missing content.
//! At most one snapshot per component is retained: taking a new one removes
//! the previous.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::ConfigBlob;
use crate::error::Result;
use crate::{io, paths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
    /// Taken by the orchestrator before redeploying over an existing config.
    PreDeploy,
    /// Taken by the phase controller before enabling secrets integration.
    PhaseTransition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub component: String,
    pub run_seq: u64,
    pub taken_at: DateTime<Utc>,
    pub reason: SnapshotReason,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub meta: SnapshotMeta,
    pub content: ConfigBlob,
}

// ---------------------------------------------------------------------------
// KeyedLocks
// ---------------------------------------------------------------------------

/// One mutex per key; writers for different keys never contend.
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string()).or_default().clone()
        };
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl SnapshotStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = paths::snapshots_dir(root);
        io::ensure_dir(&dir)?;
        Ok(Self {
            dir,
            locks: KeyedLocks::default(),
        })
    }

    fn component_dir(&self, component: &str) -> PathBuf {
        self.dir.join(component)
    }

    /// Record `content` as the component's snapshot, replacing any older one.
    pub fn take(
        &self,
        component: &str,
        run_seq: u64,
        reason: SnapshotReason,
        content: &ConfigBlob,
    ) -> Result<ConfigSnapshot> {
        paths::validate_name(component)?;
        self.locks.with_lock(component, || {
            let dir = self.component_dir(component);
            io::ensure_dir(&dir)?;
            let meta = SnapshotMeta {
                component: component.to_string(),
                run_seq,
                taken_at: Utc::now(),
                reason,
                size: content.as_bytes().len(),
            };
            let stem = format!("{:010}-{:013}", run_seq, meta.taken_at.timestamp_millis().max(0));
            io::atomic_write(&dir.join(format!("{stem}.blob")), content.as_bytes())?;
            io::atomic_write(
                &dir.join(format!("{stem}.json")),
                serde_json::to_string_pretty(&meta)?.as_bytes(),
            )?;
            for old in stems(&dir)?.into_iter().filter(|s| *s != stem) {
                remove_pair(&dir, &old)?;
            }
            debug!(component, run_seq, ?reason, "config snapshot taken");
            Ok(ConfigSnapshot {
                meta,
                content: content.clone(),
            })
        })
    }

    pub fn latest(&self, component: &str) -> Result<Option<ConfigSnapshot>> {
        paths::validate_name(component)?;
        self.locks.with_lock(component, || {
            let dir = self.component_dir(component);
            let Some(stem) = stems(&dir)?.pop() else {
                return Ok(None);
            };
            let meta: SnapshotMeta =
                serde_json::from_str(&std::fs::read_to_string(dir.join(format!("{stem}.json")))?)?;
            let content = ConfigBlob::new(std::fs::read(dir.join(format!("{stem}.blob")))?);
            Ok(Some(ConfigSnapshot { meta, content }))
        })
    }

    /// Drop every snapshot for `component`. Returns how many were removed.
    pub fn discard(&self, component: &str) -> Result<usize> {
        paths::validate_name(component)?;
        self.locks.with_lock(component, || {
            let dir = self.component_dir(component);
            let all = stems(&dir)?;
            for stem in &all {
                remove_pair(&dir, stem)?;
            }
            Ok(all.len())
        })
    }

    /// Explicit prune: one component, or every component when `None`.
    pub fn prune(&self, component: Option<&str>) -> Result<usize> {
        match component {
            Some(c) => self.discard(c),
            None => {
                let mut removed = 0;
                for meta in self.list()? {
                    removed += self.discard(&meta.component)?;
                }
                Ok(removed)
            }
        }
    }

    pub fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        let mut components: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        components.sort();
        for c in components {
            if paths::validate_name(&c).is_err() {
                continue;
            }
            if let Some(snap) = self.latest(&c)? {
                out.push(snap.meta);
            }
        }
        Ok(out)
    }
}

/// Sorted stems that have a committed metadata file.
fn stems(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut stems: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| name.strip_suffix(".json").map(str::to_string))
        .filter(|stem| dir.join(format!("{stem}.blob")).exists())
        .collect();
    stems.sort();
    Ok(stems)
}

fn remove_pair(dir: &Path, stem: &str) -> Result<()> {
    for ext in ["json", "blob"] {
        match std::fs::remove_file(dir.join(format!("{stem}.{ext}"))) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, SnapshotStore) {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn take_and_read_back() {
        let (_dir, store) = open_tmp();
        let blob = ConfigBlob::from("vault { enabled = false }");
        store
            .take("nomad", 3, SnapshotReason::PhaseTransition, &blob)
            .unwrap();
        let snap = store.latest("nomad").unwrap().unwrap();
        assert_eq!(snap.content, blob);
        assert_eq!(snap.meta.run_seq, 3);
        assert_eq!(snap.meta.reason, SnapshotReason::PhaseTransition);
    }

    #[test]
    fn new_snapshot_replaces_old() {
        let (dir, store) = open_tmp();
        store
            .take("nomad", 1, SnapshotReason::PreDeploy, &ConfigBlob::from("one"))
            .unwrap();
        store
            .take("nomad", 2, SnapshotReason::PreDeploy, &ConfigBlob::from("two"))
            .unwrap();
        assert_eq!(
            store.latest("nomad").unwrap().unwrap().content,
            ConfigBlob::from("two")
        );
        let files = std::fs::read_dir(dir.path().join(".stackup/snapshots/nomad"))
            .unwrap()
            .count();
        assert_eq!(files, 2, "one blob + one meta");
    }

    #[test]
    fn orphan_blob_is_ignored() {
        let (dir, store) = open_tmp();
        let cdir = dir.path().join(".stackup/snapshots/vault");
        std::fs::create_dir_all(&cdir).unwrap();
        std::fs::write(cdir.join("0000000001-0000000000001.blob"), b"partial").unwrap();
        assert!(store.latest("vault").unwrap().is_none());
    }

    #[test]
    fn discard_and_prune() {
        let (_dir, store) = open_tmp();
        for c in ["nomad", "vault", "traefik"] {
            store
                .take(c, 1, SnapshotReason::PreDeploy, &ConfigBlob::from(c))
                .unwrap();
        }
        assert_eq!(store.discard("nomad").unwrap(), 1);
        assert!(store.latest("nomad").unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.prune(None).unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn rejects_path_like_component_names() {
        let (_dir, store) = open_tmp();
        assert!(store
            .take("../etc", 1, SnapshotReason::PreDeploy, &ConfigBlob::from("x"))
            .is_err());
    }

    #[test]
    fn concurrent_takes_for_different_components() {
        let (_dir, store) = open_tmp();
        let store = Arc::new(store);
        let handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|c| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for seq in 1..=5 {
                        store
                            .take(c, seq, SnapshotReason::PreDeploy, &ConfigBlob::from(format!("{c}{seq}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for c in ["a", "b", "c", "d"] {
            let snap = store.latest(c).unwrap().unwrap();
            assert_eq!(snap.meta.run_seq, 5);
            assert_eq!(snap.content, ConfigBlob::from(format!("{c}5")));
        }
    }
}
