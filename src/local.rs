//! On-device store for the signed-out tier.
//!
//! A small SQLite database with three shapes of data: scalar key/values,
//! named string sets, and one serialized blob slot per content family.
//! Reads never fail outward: unreadable data is treated as "no data yet".

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::models::{ItemType, PositionItem, Scene};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS string_sets (
    set_name TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (set_name, member)
);

CREATE TABLE IF NOT EXISTS blobs (
    slot TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
"#;

pub const SCENES_SLOT: &str = "scenes";
pub const POSITIONS_SLOT: &str = "positions";

fn favorites_set(item_type: ItemType) -> String {
    format!("favorites.{}", item_type.as_str())
}

fn seeded_key(owner_id: &str) -> String {
    format!("seeded.{}", owner_id)
}

fn put_blob(conn: &Connection, slot: &str, data: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO blobs (slot, data) VALUES (?1, ?2)",
        params![slot, data],
    )?;
    Ok(())
}

/// Deserialize a slot; unreadable or corrupt data reads as empty
fn read_list<T: DeserializeOwned>(conn: &Connection, slot: &str) -> Vec<T> {
    let raw: Option<String> = match conn
        .query_row("SELECT data FROM blobs WHERE slot = ?1", [slot], |row| row.get(0))
        .optional()
    {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("Failed to read local slot {}: {}", slot, e);
            return Vec::new();
        }
    };

    let Some(raw) = raw else {
        return Vec::new();
    };

    match serde_json::from_str(&raw) {
        Ok(items) => items,
        Err(e) => {
            let err = SyncError::LocalStorageCorrupt(format!("{}: {}", slot, e));
            log::warn!("{} - treating as empty", err);
            Vec::new()
        }
    }
}

pub struct LocalStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        log::debug!("Opened local store at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Store that lives only as long as the process (tests, previews)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ==================== BLOB SLOTS ====================

    /// Raw write into a blob slot
    pub fn put_blob(&self, slot: &str, data: &str) -> Result<()> {
        let conn = self.conn.lock();
        put_blob(&conn, slot, data)
    }

    fn load_list<T: DeserializeOwned>(&self, slot: &str) -> Vec<T> {
        let conn = self.conn.lock();
        read_list(&conn, slot)
    }

    fn save_list<T: Serialize>(&self, slot: &str, items: &[T]) -> Result<()> {
        let json = serde_json::to_string(items)?;
        self.put_blob(slot, &json)
    }

    /// Read-modify-write of one slot under a single lock
    fn modify_list<T, F>(&self, slot: &str, f: F) -> Result<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> bool,
    {
        let conn = self.conn.lock();
        let mut items: Vec<T> = read_list(&conn, slot);
        if !f(&mut items) {
            return Ok(false);
        }
        let json = serde_json::to_string(&items)?;
        put_blob(&conn, slot, &json)?;
        Ok(true)
    }

    pub fn load_scenes(&self) -> Vec<Scene> {
        self.load_list(SCENES_SLOT)
    }

    /// Replaces the whole scene collection
    pub fn save_scenes(&self, scenes: &[Scene]) -> Result<()> {
        self.save_list(SCENES_SLOT, scenes)
    }

    /// Drop one scene by its local id. Returns whether it was present.
    pub fn remove_scene(&self, doc_id: &str) -> Result<bool> {
        self.modify_list(SCENES_SLOT, |scenes: &mut Vec<Scene>| {
            let before = scenes.len();
            scenes.retain(|s| s.doc_id.as_deref() != Some(doc_id));
            scenes.len() != before
        })
    }

    /// Replace the scene with the same local id. Returns whether it was present.
    pub fn replace_scene(&self, scene: &Scene) -> Result<bool> {
        self.modify_list(SCENES_SLOT, |scenes: &mut Vec<Scene>| {
            match scenes.iter_mut().find(|s| s.doc_id == scene.doc_id) {
                Some(slot) => {
                    *slot = scene.clone();
                    true
                }
                None => false,
            }
        })
    }

    pub fn push_scene(&self, scene: &Scene) -> Result<()> {
        self.modify_list(SCENES_SLOT, |scenes: &mut Vec<Scene>| {
            scenes.push(scene.clone());
            true
        })?;
        Ok(())
    }

    pub fn load_positions(&self) -> Vec<PositionItem> {
        self.load_list(POSITIONS_SLOT)
    }

    pub fn save_positions(&self, positions: &[PositionItem]) -> Result<()> {
        self.save_list(POSITIONS_SLOT, positions)
    }

    pub fn remove_position(&self, doc_id: &str) -> Result<bool> {
        self.modify_list(POSITIONS_SLOT, |positions: &mut Vec<PositionItem>| {
            let before = positions.len();
            positions.retain(|p| p.doc_id.as_deref() != Some(doc_id));
            positions.len() != before
        })
    }

    pub fn replace_position(&self, position: &PositionItem) -> Result<bool> {
        self.modify_list(POSITIONS_SLOT, |positions: &mut Vec<PositionItem>| {
            match positions.iter_mut().find(|p| p.doc_id == position.doc_id) {
                Some(slot) => {
                    *slot = position.clone();
                    true
                }
                None => false,
            }
        })
    }

    pub fn push_position(&self, position: &PositionItem) -> Result<()> {
        self.modify_list(POSITIONS_SLOT, |positions: &mut Vec<PositionItem>| {
            positions.push(position.clone());
            true
        })?;
        Ok(())
    }

    // ==================== FAVORITE SETS ====================

    pub fn load_favorite_ids(&self, item_type: ItemType) -> BTreeSet<String> {
        let set_name = favorites_set(item_type);
        let conn = self.conn.lock();
        let result = conn
            .prepare("SELECT member FROM string_sets WHERE set_name = ?1")
            .and_then(|mut stmt| {
                let rows = stmt.query_map([&set_name], |row| row.get::<_, String>(0))?;
                rows.collect::<std::result::Result<BTreeSet<_>, _>>()
            });

        match result {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Failed to read {}: {}", set_name, e);
                BTreeSet::new()
            }
        }
    }

    /// Returns whether the set changed
    pub fn add_favorite_id(&self, item_type: ItemType, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO string_sets (set_name, member) VALUES (?1, ?2)",
            params![favorites_set(item_type), id],
        )?;
        Ok(changed > 0)
    }

    /// Returns whether the set changed
    pub fn remove_favorite_id(&self, item_type: ItemType, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM string_sets WHERE set_name = ?1 AND member = ?2",
            params![favorites_set(item_type), id],
        )?;
        Ok(changed > 0)
    }

    /// Point a favorite at an item's new id after it moved tiers
    pub fn rename_favorite_id(&self, item_type: ItemType, old_id: &str, new_id: &str) -> Result<()> {
        let set_name = favorites_set(item_type);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM string_sets WHERE set_name = ?1 AND member = ?2",
            params![set_name, old_id],
        )?;
        if removed > 0 {
            tx.execute(
                "INSERT OR IGNORE INTO string_sets (set_name, member) VALUES (?1, ?2)",
                params![set_name, new_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ==================== KEY/VALUE ====================

    pub fn get_value(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .ok()
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove_value(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_value(key)
            .map(|s| s == "true" || s == "1")
            .unwrap_or(default)
    }

    /// Fast-path flag; the cloud ordinal check is the real guard
    pub fn is_seeded(&self, owner_id: &str) -> bool {
        self.get_bool(&seeded_key(owner_id), false)
    }

    pub fn mark_seeded(&self, owner_id: &str) -> Result<()> {
        self.set_value(&seeded_key(owner_id), "true")
    }

    /// Reset to defaults: custom scenes, custom positions and favorite sets
    pub fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM blobs WHERE slot IN (?1, ?2)",
            params![SCENES_SLOT, POSITIONS_SLOT],
        )?;
        conn.execute("DELETE FROM string_sets WHERE set_name LIKE 'favorites.%'", [])?;
        log::info!("Cleared local scenes, positions and favorites");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> LocalStore {
        LocalStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_scene_slot_roundtrip() {
        let store = create_test_store();
        assert!(store.load_scenes().is_empty());

        let mut scene = Scene::custom("Foo", "Bar");
        scene.doc_id = Some("local_1".into());
        store.save_scenes(&[scene.clone()]).unwrap();

        assert_eq!(store.load_scenes(), vec![scene]);
    }

    #[test]
    fn test_corrupt_slot_yields_empty() {
        let store = create_test_store();
        store.put_blob(SCENES_SLOT, "{not json").unwrap();
        assert!(store.load_scenes().is_empty());

        store.put_blob(POSITIONS_SLOT, "42").unwrap();
        assert!(store.load_positions().is_empty());
    }

    #[test]
    fn test_favorite_ids_idempotent() {
        let store = create_test_store();

        assert!(store.add_favorite_id(ItemType::Scene, "asset_3").unwrap());
        assert!(!store.add_favorite_id(ItemType::Scene, "asset_3").unwrap());
        assert_eq!(store.load_favorite_ids(ItemType::Scene).len(), 1);
        assert!(store.load_favorite_ids(ItemType::Position).is_empty());

        assert!(store.remove_favorite_id(ItemType::Scene, "asset_3").unwrap());
        assert!(!store.remove_favorite_id(ItemType::Scene, "asset_3").unwrap());
        assert!(store.load_favorite_ids(ItemType::Scene).is_empty());
    }

    #[test]
    fn test_rename_favorite_id() {
        let store = create_test_store();
        store.add_favorite_id(ItemType::Scene, "local_1").unwrap();

        store.rename_favorite_id(ItemType::Scene, "local_1", "doc9").unwrap();
        let ids = store.load_favorite_ids(ItemType::Scene);
        assert!(ids.contains("doc9"));
        assert!(!ids.contains("local_1"));

        // Renaming an id that is not a favorite adds nothing
        store.rename_favorite_id(ItemType::Scene, "local_2", "doc10").unwrap();
        assert!(!store.load_favorite_ids(ItemType::Scene).contains("doc10"));
    }

    #[test]
    fn test_seeded_flag_per_owner() {
        let store = create_test_store();
        assert!(!store.is_seeded("alice"));
        store.mark_seeded("alice").unwrap();
        assert!(store.is_seeded("alice"));
        assert!(!store.is_seeded("bob"));
    }

    #[test]
    fn test_clear_all_keeps_seeded_flags() {
        let store = create_test_store();
        store.save_scenes(&[Scene::custom("a", "b")]).unwrap();
        store.save_positions(&[PositionItem::custom("p", "/tmp/p.png")]).unwrap();
        store.add_favorite_id(ItemType::Position, "cat.png").unwrap();
        store.mark_seeded("alice").unwrap();

        store.clear_all().unwrap();

        assert!(store.load_scenes().is_empty());
        assert!(store.load_positions().is_empty());
        assert!(store.load_favorite_ids(ItemType::Position).is_empty());
        assert!(store.is_seeded("alice"));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/local.db");
        {
            let store = LocalStore::open(&path).unwrap();
            store.set_value("k", "v").unwrap();
        }
        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.get_value("k"), Some("v".to_string()));
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
