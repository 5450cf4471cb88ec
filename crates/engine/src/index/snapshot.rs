// Advisory warm-start snapshot of the item table.
//
// One JSON file at `<cache_dir>/index.snap.json`. Absence, corruption,
// or an unknown version all load as "no cache" — the snapshot is an
// optimization and must never prevent a rebuild from the remote API.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use atlas_common::error::{Error, Result};
use atlas_common::types::Item;

const SNAPSHOT_FILE: &str = "index.snap.json";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    version: u32,
    built_at: DateTime<Utc>,
    items: Vec<Item>,
}

/// Stores the flat item table at `<cache_dir>/index.snap.json`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    cache_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(cache_dir: impl AsRef<Path>) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir).map_err(|error| {
            Error::Snapshot(format!(
                "failed to create cache directory `{}`: {error}",
                cache_dir.display()
            ))
        })?;
        Ok(Self { cache_dir })
    }

    /// Persist the item table atomically (temp file + fsync + rename).
    pub fn save(&self, built_at: DateTime<Utc>, items: &[Item]) -> Result<PathBuf> {
        let doc = SnapshotDoc { version: SNAPSHOT_VERSION, built_at, items: items.to_vec() };
        let payload = serde_json::to_vec(&doc)
            .map_err(|error| Error::Snapshot(format!("failed to encode snapshot: {error}")))?;

        let target_path = self.snapshot_path();
        let tmp_path = self.temp_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|error| {
                Error::Snapshot(format!(
                    "failed to open temp snapshot `{}`: {error}",
                    tmp_path.display()
                ))
            })?;
        file.write_all(&payload)
            .and_then(|_| file.sync_data())
            .map_err(|error| Error::Snapshot(format!("failed to write snapshot: {error}")))?;
        drop(file);

        fs::rename(&tmp_path, &target_path).map_err(|error| {
            Error::Snapshot(format!(
                "failed to move snapshot `{}` to `{}`: {error}",
                tmp_path.display(),
                target_path.display()
            ))
        })?;

        Ok(target_path)
    }

    /// Load the snapshot if present and intact. Corruption is swallowed
    /// into `None` with a warning.
    pub fn load(&self) -> Option<(DateTime<Utc>, Vec<Item>)> {
        let path = self.snapshot_path();
        if !path.exists() {
            return None;
        }

        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "unreadable snapshot, ignoring");
                return None;
            }
        };
        let doc: SnapshotDoc = match serde_json::from_slice(&contents) {
            Ok(doc) => doc,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "corrupt snapshot, ignoring");
                return None;
            }
        };
        if doc.version != SNAPSHOT_VERSION {
            warn!(path = %path.display(), version = doc.version, "unknown snapshot version, ignoring");
            return None;
        }

        Some((doc.built_at, doc.items))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.cache_dir.join(SNAPSHOT_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();
        self.cache_dir.join(format!("{SNAPSHOT_FILE}.tmp.{nonce}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_common::types::{ItemKind, ParentKind};
    use tempfile::tempdir;

    fn item(id: &str, parent_id: Option<&str>) -> Item {
        Item {
            id: id.to_string(),
            title: format!("Item {id}"),
            kind: ItemKind::Page,
            icon: None,
            has_children: false,
            created_at: Utc::now(),
            last_edited_at: Utc::now(),
            parent_kind: if parent_id.is_some() { ParentKind::Item } else { ParentKind::Root },
            parent_id: parent_id.map(ToOwned::to_owned),
            url: String::new(),
        }
    }

    #[test]
    fn saves_and_loads_round_trip() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path().join("cache")).expect("snapshot store");
        let built_at = Utc::now();
        let items = vec![item("a", None), item("b", Some("a"))];

        store.save(built_at, &items).expect("snapshot should save");
        let (loaded_at, loaded) = store.load().expect("snapshot should load");

        assert_eq!(loaded_at, built_at);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[1].parent_id.as_deref(), Some("a"));
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");
        assert!(store.load().is_none());
    }

    #[test]
    fn corrupt_snapshot_loads_as_none() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");
        std::fs::write(store.snapshot_path(), b"{ not json").expect("write should succeed");
        assert!(store.load().is_none());
    }

    #[test]
    fn unknown_version_loads_as_none() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");
        let doc = serde_json::json!({
            "version": SNAPSHOT_VERSION + 1,
            "built_at": Utc::now(),
            "items": [],
        });
        std::fs::write(store.snapshot_path(), serde_json::to_vec(&doc).unwrap())
            .expect("write should succeed");
        assert!(store.load().is_none());
    }

    #[test]
    fn save_replaces_previous_snapshot_and_leaves_no_temp_files() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = SnapshotStore::new(tmp.path()).expect("snapshot store");

        store.save(Utc::now(), &[item("a", None)]).expect("first save");
        store.save(Utc::now(), &[item("b", None)]).expect("second save");

        let (_, items) = store.load().expect("snapshot should load");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "b");

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .expect("cache dir should list")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files must not accumulate");
    }
}
