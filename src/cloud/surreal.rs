//! SurrealDB-backed cloud store.
//!
//! Documents are keyed by array record ids `[owner_id, key]` (favorites by
//! `[owner_id, item_type, item_id]`), so a record can only be addressed through
//! its owner and a favorite can exist at most once per owner and item.
//!
//! Subscriptions re-query the owner's collection whenever a change notice for
//! that family and owner arrives. Notices come from writes made through this
//! store and, once [`SurrealCloudStore::watch_remote_changes`] is running, from
//! SurrealDB live queries.

use std::collections::BTreeSet;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::{Notification, Surreal};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{require_owner, CloudStore, Subscription};
use crate::config::CloudConfig;
use crate::error::{Result, SyncError};
use crate::ids::{self, ImageRef};
use crate::models::{Favorite, ItemType, PositionItem, Scene};

const SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS scene SCHEMALESS;
DEFINE TABLE IF NOT EXISTS position SCHEMALESS;
DEFINE TABLE IF NOT EXISTS favorite SCHEMALESS;
DEFINE TABLE IF NOT EXISTS image SCHEMALESS;
DEFINE INDEX IF NOT EXISTS scene_owner ON TABLE scene COLUMNS owner_id;
DEFINE INDEX IF NOT EXISTS position_owner ON TABLE position COLUMNS owner_id;
DEFINE INDEX IF NOT EXISTS favorite_owner ON TABLE favorite COLUMNS owner_id;
"#;

const SEED_QUERY: &str = r#"
BEGIN TRANSACTION;
FOR $row IN $rows {
    CREATE type::thing('scene', [$owner, $row.key]) CONTENT $row;
};
COMMIT TRANSACTION;
"#;

/// Content family a change notice refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Scene,
    Position,
    Favorite,
}

impl Family {
    const ALL: [Family; 3] = [Family::Scene, Family::Position, Family::Favorite];

    fn table(&self) -> &'static str {
        match self {
            Family::Scene => "scene",
            Family::Position => "position",
            Family::Favorite => "favorite",
        }
    }
}

#[derive(Debug, Clone)]
struct ChangeNotice {
    family: Family,
    owner_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SceneDoc {
    key: String,
    owner_id: String,
    #[serde(default)]
    original_ordinal: Option<u32>,
    title: String,
    content: String,
    is_custom: bool,
}

impl SceneDoc {
    fn into_scene(self) -> Scene {
        Scene {
            doc_id: Some(self.key),
            original_ordinal: self.original_ordinal,
            title: self.title,
            content: self.content,
            is_custom: self.is_custom,
            owner_id: Some(self.owner_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PositionDoc {
    key: String,
    owner_id: String,
    display_name: String,
    image_ref: String,
    #[serde(default)]
    is_favorite: bool,
}

impl PositionDoc {
    fn into_position(self) -> PositionItem {
        PositionItem {
            doc_id: Some(self.key),
            display_name: self.display_name,
            image_ref: self.image_ref,
            is_asset: false,
            owner_id: Some(self.owner_id),
            is_favorite: self.is_favorite,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FavoriteDoc {
    owner_id: String,
    item_id: String,
    item_type: String,
    /// Unix ms
    created_at: i64,
}

impl FavoriteDoc {
    fn into_favorite(self) -> Option<Favorite> {
        let item_type = ItemType::parse(&self.item_type)?;
        let created_at = Utc
            .timestamp_millis_opt(self.created_at)
            .single()
            .unwrap_or_else(Utc::now);
        Some(Favorite {
            item_id: self.item_id,
            item_type,
            owner_id: self.owner_id,
            created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageDoc {
    key: String,
    owner_id: String,
    file_name: String,
    /// base64
    data: String,
}

#[derive(Debug, Deserialize)]
struct OrdinalRow {
    #[serde(default)]
    original_ordinal: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    owner_id: String,
}

/// Key of an existing cloud document, or `NotMigrated`
fn cloud_key(doc_id: &Option<String>, fallback: &str) -> Result<String> {
    match doc_id.as_deref() {
        Some(id) if !id.is_empty() && !ids::is_local_id(id) => Ok(id.to_string()),
        _ => Err(SyncError::NotMigrated(fallback.to_string())),
    }
}

/// Key to use for a new document
fn assign_key(doc_id: &Option<String>) -> String {
    match doc_id.as_deref() {
        Some(id) if !id.is_empty() && !ids::is_local_id(id) => id.to_string(),
        _ => ids::new_document_key(),
    }
}

type Fetch<T> = fn(SurrealCloudStore, String) -> BoxFuture<'static, Result<Vec<T>>>;

/// SurrealDB cloud store
#[derive(Clone)]
pub struct SurrealCloudStore {
    db: Surreal<Any>,
    changes: broadcast::Sender<ChangeNotice>,
}

impl SurrealCloudStore {
    /// Connect using the cloud section of the config
    pub async fn connect(config: &CloudConfig) -> Result<Self> {
        let db = any::connect(config.endpoint.as_str()).await?;

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await?;
        }

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await?;

        let store = Self::from_db(db);
        store.initialize_schema().await?;

        if config.live_queries {
            store.watch_remote_changes().await?;
        }

        log::info!("Connected to cloud store at {}", config.endpoint);
        Ok(store)
    }

    /// Create a new in-memory store (for development/testing)
    pub async fn new_memory() -> Result<Self> {
        let db = any::connect("mem://").await?;
        db.use_ns("scene_studio").use_db("content").await?;

        let store = Self::from_db(db);
        store.initialize_schema().await?;
        Ok(store)
    }

    fn from_db(db: Surreal<Any>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self { db, changes }
    }

    async fn initialize_schema(&self) -> Result<()> {
        self.db.query(SCHEMA).await?.check()?;
        log::debug!("Cloud schema initialized");
        Ok(())
    }

    /// Forward SurrealDB live-query notifications (writes from other devices)
    /// into the change feed. Runs until the connection closes.
    pub async fn watch_remote_changes(&self) -> Result<()> {
        for family in Family::ALL {
            let mut response = self
                .db
                .query(format!("LIVE SELECT * FROM {}", family.table()))
                .await?;
            let mut stream = response.stream::<Notification<ChangeRow>>(0)?;
            let changes = self.changes.clone();

            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(notification) => {
                            let _ = changes.send(ChangeNotice {
                                family,
                                owner_id: notification.data.owner_id,
                            });
                        }
                        Err(e) => log::warn!("Live query on {} failed: {}", family.table(), e),
                    }
                }
                log::debug!("Live query on {} ended", family.table());
            });
        }
        Ok(())
    }

    fn notify(&self, family: Family, owner_id: &str) {
        // No receivers just means nobody is subscribed
        let _ = self.changes.send(ChangeNotice {
            family,
            owner_id: owner_id.to_string(),
        });
    }

    /// Full-snapshot stream of one owner's collection. The first snapshot is
    /// fetched here so a failing backend is reported to the subscriber.
    async fn live_list<T: Send + 'static>(
        &self,
        family: Family,
        owner_id: &str,
        fetch: Fetch<T>,
    ) -> Result<Subscription<T>> {
        // Subscribe before the first fetch so no change can slip between them
        let rx = self.changes.subscribe();
        let initial = fetch(self.clone(), owner_id.to_string()).await?;
        let state = (self.clone(), owner_id.to_string(), rx, Some(initial));

        let stream = futures::stream::unfold(state, move |(store, owner, mut rx, initial)| async move {
            if let Some(items) = initial {
                return Some((items, (store, owner, rx, None)));
            }
            loop {
                loop {
                    match rx.recv().await {
                        Ok(notice) if notice.family == family && notice.owner_id == owner => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            log::debug!("Subscription lagged by {} notices", skipped);
                            break;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }

                match fetch(store.clone(), owner.clone()).await {
                    Ok(items) => return Some((items, (store, owner, rx, None))),
                    Err(e) => {
                        log::warn!("Refreshing {} for {} failed: {}", family.table(), owner, e);
                    }
                }
            }
        });

        Ok(Subscription::new(stream))
    }

    // ==================== SCENES ====================

    async fn fetch_scenes(&self, owner_id: &str) -> Result<Vec<Scene>> {
        let docs: Vec<SceneDoc> = self
            .db
            .query(
                "SELECT key, owner_id, original_ordinal, title, content, is_custom \
                 FROM scene WHERE owner_id = $owner",
            )
            .bind(("owner", owner_id.to_string()))
            .await?
            .take(0)?;

        let mut scenes: Vec<Scene> = docs.into_iter().map(SceneDoc::into_scene).collect();
        scenes.sort_by(|a, b| {
            (a.is_custom, a.original_ordinal, &a.doc_id).cmp(&(b.is_custom, b.original_ordinal, &b.doc_id))
        });
        Ok(scenes)
    }

    // ==================== POSITIONS ====================

    async fn fetch_positions(&self, owner_id: &str) -> Result<Vec<PositionItem>> {
        let docs: Vec<PositionDoc> = self
            .db
            .query(
                "SELECT key, owner_id, display_name, image_ref, is_favorite \
                 FROM position WHERE owner_id = $owner",
            )
            .bind(("owner", owner_id.to_string()))
            .await?
            .take(0)?;

        let mut positions: Vec<PositionItem> =
            docs.into_iter().map(PositionDoc::into_position).collect();
        positions.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(positions)
    }

    // ==================== FAVORITES ====================

    async fn fetch_favorites(&self, owner_id: &str) -> Result<Vec<Favorite>> {
        let docs: Vec<FavoriteDoc> = self
            .db
            .query(
                "SELECT owner_id, item_id, item_type, created_at \
                 FROM favorite WHERE owner_id = $owner",
            )
            .bind(("owner", owner_id.to_string()))
            .await?
            .take(0)?;

        Ok(docs
            .into_iter()
            .filter_map(FavoriteDoc::into_favorite)
            .collect())
    }
}

#[async_trait]
impl CloudStore for SurrealCloudStore {
    async fn subscribe_scenes(&self, owner_id: &str) -> Result<Subscription<Scene>> {
        let owner_id = require_owner(owner_id)?;
        self.live_list(Family::Scene, owner_id, |store, owner| {
            async move { store.fetch_scenes(&owner).await }.boxed()
        })
        .await
    }

    async fn list_scenes(&self, owner_id: &str) -> Result<Vec<Scene>> {
        self.fetch_scenes(require_owner(owner_id)?).await
    }

    async fn add_scene(&self, owner_id: &str, scene: Scene) -> Result<Scene> {
        let owner_id = require_owner(owner_id)?;
        let doc = SceneDoc {
            key: assign_key(&scene.doc_id),
            owner_id: owner_id.to_string(),
            original_ordinal: scene.original_ordinal,
            title: scene.title,
            content: scene.content,
            is_custom: scene.is_custom,
        };

        self.db
            .query("CREATE type::thing('scene', [$owner, $key]) CONTENT $doc")
            .bind(("owner", owner_id.to_string()))
            .bind(("key", doc.key.clone()))
            .bind(("doc", doc.clone()))
            .await?
            .check()?;

        log::debug!("Added scene {} for {}", doc.key, owner_id);
        self.notify(Family::Scene, owner_id);
        Ok(doc.into_scene())
    }

    async fn update_scene(&self, owner_id: &str, scene: &Scene) -> Result<()> {
        let owner_id = require_owner(owner_id)?;
        let key = cloud_key(&scene.doc_id, &scene.title)?;
        let patch = serde_json::json!({
            "title": scene.title,
            "content": scene.content,
        });

        let updated: Vec<String> = self
            .db
            .query("UPDATE type::thing('scene', [$owner, $key]) MERGE $patch RETURN VALUE key")
            .bind(("owner", owner_id.to_string()))
            .bind(("key", key.clone()))
            .bind(("patch", patch))
            .await?
            .take(0)?;

        if updated.is_empty() {
            return Err(SyncError::NotFound(key));
        }
        self.notify(Family::Scene, owner_id);
        Ok(())
    }

    async fn delete_scene(&self, owner_id: &str, doc_id: &str) -> Result<()> {
        let owner_id = require_owner(owner_id)?;
        self.db
            .query("DELETE type::thing('scene', [$owner, $key])")
            .bind(("owner", owner_id.to_string()))
            .bind(("key", doc_id.to_string()))
            .await?
            .check()?;

        log::debug!("Deleted scene {} for {}", doc_id, owner_id);
        self.notify(Family::Scene, owner_id);
        Ok(())
    }

    async fn batch_seed_scenes(&self, owner_id: &str, scenes: Vec<Scene>) -> Result<usize> {
        let owner_id = require_owner(owner_id)?;
        let rows: Vec<SceneDoc> = scenes
            .into_iter()
            .filter_map(|scene| {
                let ordinal = scene.original_ordinal?;
                Some(SceneDoc {
                    key: ids::asset_scene_id(ordinal),
                    owner_id: owner_id.to_string(),
                    original_ordinal: Some(ordinal),
                    title: scene.title,
                    content: scene.content,
                    is_custom: false,
                })
            })
            .collect();

        if rows.is_empty() {
            return Ok(0);
        }

        let count = rows.len();
        self.db
            .query(SEED_QUERY)
            .bind(("owner", owner_id.to_string()))
            .bind(("rows", rows))
            .await?
            .check()?;

        log::info!("Seeded {} default scenes for {}", count, owner_id);
        self.notify(Family::Scene, owner_id);
        Ok(count)
    }

    async fn query_existing_default_ordinals(&self, owner_id: &str) -> Result<BTreeSet<u32>> {
        let owner_id = require_owner(owner_id)?;
        let rows: Vec<OrdinalRow> = self
            .db
            .query("SELECT original_ordinal FROM scene WHERE owner_id = $owner AND is_custom = false")
            .bind(("owner", owner_id.to_string()))
            .await?
            .take(0)?;

        Ok(rows.into_iter().filter_map(|r| r.original_ordinal).collect())
    }

    async fn subscribe_positions(&self, owner_id: &str) -> Result<Subscription<PositionItem>> {
        let owner_id = require_owner(owner_id)?;
        self.live_list(Family::Position, owner_id, |store, owner| {
            async move { store.fetch_positions(&owner).await }.boxed()
        })
        .await
    }

    async fn list_positions(&self, owner_id: &str) -> Result<Vec<PositionItem>> {
        self.fetch_positions(require_owner(owner_id)?).await
    }

    async fn add_position(&self, owner_id: &str, position: PositionItem) -> Result<PositionItem> {
        let owner_id = require_owner(owner_id)?;
        if position.is_asset {
            return Err(SyncError::ReadOnly(position.image_ref));
        }
        let doc = PositionDoc {
            key: assign_key(&position.doc_id),
            owner_id: owner_id.to_string(),
            display_name: position.display_name,
            image_ref: position.image_ref,
            is_favorite: position.is_favorite,
        };

        self.db
            .query("CREATE type::thing('position', [$owner, $key]) CONTENT $doc")
            .bind(("owner", owner_id.to_string()))
            .bind(("key", doc.key.clone()))
            .bind(("doc", doc.clone()))
            .await?
            .check()?;

        self.notify(Family::Position, owner_id);
        Ok(doc.into_position())
    }

    async fn update_position(&self, owner_id: &str, position: &PositionItem) -> Result<()> {
        let owner_id = require_owner(owner_id)?;
        let key = cloud_key(&position.doc_id, &position.display_name)?;
        let patch = serde_json::json!({
            "display_name": position.display_name,
            "image_ref": position.image_ref,
            "is_favorite": position.is_favorite,
        });

        let updated: Vec<String> = self
            .db
            .query("UPDATE type::thing('position', [$owner, $key]) MERGE $patch RETURN VALUE key")
            .bind(("owner", owner_id.to_string()))
            .bind(("key", key.clone()))
            .bind(("patch", patch))
            .await?
            .take(0)?;

        if updated.is_empty() {
            return Err(SyncError::NotFound(key));
        }
        self.notify(Family::Position, owner_id);
        Ok(())
    }

    async fn delete_position(&self, owner_id: &str, doc_id: &str) -> Result<()> {
        let owner_id = require_owner(owner_id)?;
        self.db
            .query("DELETE type::thing('position', [$owner, $key])")
            .bind(("owner", owner_id.to_string()))
            .bind(("key", doc_id.to_string()))
            .await?
            .check()?;

        self.notify(Family::Position, owner_id);
        Ok(())
    }

    async fn upload_image(&self, owner_id: &str, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        let owner_id = require_owner(owner_id)?;
        let doc = ImageDoc {
            key: ids::new_document_key(),
            owner_id: owner_id.to_string(),
            file_name: file_name.to_string(),
            data: BASE64_STANDARD.encode(&bytes),
        };
        let url = ids::cloud_image_url(owner_id, &doc.key);

        self.db
            .query("CREATE type::thing('image', [$owner, $key]) CONTENT $doc")
            .bind(("owner", owner_id.to_string()))
            .bind(("key", doc.key.clone()))
            .bind(("doc", doc))
            .await?
            .check()?;

        log::debug!("Uploaded {} ({} bytes) as {}", file_name, bytes.len(), url);
        Ok(url)
    }

    async fn download_image(&self, owner_id: &str, url: &str) -> Result<Vec<u8>> {
        let owner_id = require_owner(owner_id)?;
        let (image_owner, key) = match ImageRef::classify(url) {
            ImageRef::Cloud { owner_id, key } => (owner_id, key),
            _ => return Err(SyncError::UnsupportedImage(url.to_string())),
        };
        if image_owner != owner_id {
            return Err(SyncError::Permission(format!(
                "image {} belongs to another account",
                url
            )));
        }

        let docs: Vec<ImageDoc> = self
            .db
            .query("SELECT key, owner_id, file_name, data FROM type::thing('image', [$owner, $key])")
            .bind(("owner", owner_id.to_string()))
            .bind(("key", key))
            .await?
            .take(0)?;

        let doc = docs
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound(url.to_string()))?;
        BASE64_STANDARD
            .decode(doc.data.as_bytes())
            .map_err(|e| SyncError::NetworkOrBackend(format!("corrupt image {}: {}", url, e)))
    }

    async fn subscribe_favorites(&self, owner_id: &str) -> Result<Subscription<Favorite>> {
        let owner_id = require_owner(owner_id)?;
        self.live_list(Family::Favorite, owner_id, |store, owner| {
            async move { store.fetch_favorites(&owner).await }.boxed()
        })
        .await
    }

    async fn list_favorites(&self, owner_id: &str) -> Result<Vec<Favorite>> {
        self.fetch_favorites(require_owner(owner_id)?).await
    }

    async fn add_favorite(&self, owner_id: &str, item_id: &str, item_type: ItemType) -> Result<()> {
        let owner_id = require_owner(owner_id)?;
        let doc = FavoriteDoc {
            owner_id: owner_id.to_string(),
            item_id: item_id.to_string(),
            item_type: item_type.as_str().to_string(),
            created_at: Utc::now().timestamp_millis(),
        };

        // Keyed by (owner, type, item): repeating the add leaves one record
        self.db
            .query("UPSERT type::thing('favorite', [$owner, $item_type, $item_id]) CONTENT $doc")
            .bind(("owner", owner_id.to_string()))
            .bind(("item_type", item_type.as_str().to_string()))
            .bind(("item_id", item_id.to_string()))
            .bind(("doc", doc))
            .await?
            .check()?;

        self.notify(Family::Favorite, owner_id);
        Ok(())
    }

    async fn remove_favorite(
        &self,
        owner_id: &str,
        item_id: &str,
        item_type: ItemType,
    ) -> Result<()> {
        let owner_id = require_owner(owner_id)?;
        self.db
            .query("DELETE type::thing('favorite', [$owner, $item_type, $item_id])")
            .bind(("owner", owner_id.to_string()))
            .bind(("item_type", item_type.as_str().to_string()))
            .bind(("item_id", item_id.to_string()))
            .await?
            .check()?;

        self.notify(Family::Favorite, owner_id);
        Ok(())
    }

    async fn query_is_favorited(
        &self,
        owner_id: &str,
        item_id: &str,
        item_type: ItemType,
    ) -> Result<bool> {
        let owner_id = require_owner(owner_id)?;
        let rows: Vec<FavoriteDoc> = self
            .db
            .query(
                "SELECT owner_id, item_id, item_type, created_at \
                 FROM type::thing('favorite', [$owner, $item_type, $item_id])",
            )
            .bind(("owner", owner_id.to_string()))
            .bind(("item_type", item_type.as_str().to_string()))
            .bind(("item_id", item_id.to_string()))
            .await?
            .take(0)?;

        Ok(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_store() -> SurrealCloudStore {
        SurrealCloudStore::new_memory()
            .await
            .expect("Failed to create test store")
    }

    #[tokio::test]
    async fn test_add_assigns_document_id() {
        let store = create_test_store().await;
        let mut scene = Scene::custom("Foo", "Bar");
        scene.doc_id = Some(ids::new_local_id());

        let stored = store.add_scene("alice", scene).await.unwrap();
        let doc_id = stored.doc_id.clone().unwrap();
        assert!(!doc_id.is_empty());
        assert!(!ids::is_local_id(&doc_id));
        assert_eq!(stored.owner_id.as_deref(), Some("alice"));

        let listed = store.list_scenes("alice").await.unwrap();
        assert_eq!(listed, vec![stored]);
    }

    #[tokio::test]
    async fn test_requires_owner() {
        let store = create_test_store().await;
        let err = store.list_scenes("").await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));
        let err = store
            .add_favorite("", "asset_1", ItemType::Scene)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_owner_isolation() {
        let store = create_test_store().await;
        store.add_scene("alice", Scene::custom("A", "")).await.unwrap();
        store.add_scene("bob", Scene::custom("B", "")).await.unwrap();

        let alice = store.list_scenes("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].title, "A");
    }

    #[tokio::test]
    async fn test_update_and_delete_scene() {
        let store = create_test_store().await;
        let mut stored = store.add_scene("alice", Scene::custom("Foo", "")).await.unwrap();

        stored.title = "Renamed".into();
        store.update_scene("alice", &stored).await.unwrap();
        assert_eq!(store.list_scenes("alice").await.unwrap()[0].title, "Renamed");

        // Another owner cannot reach the document
        let err = store.update_scene("bob", &stored).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        store
            .delete_scene("alice", stored.doc_id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(store.list_scenes("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_without_doc_id_is_rejected() {
        let store = create_test_store().await;
        let mut scene = Scene::custom("Foo", "");
        scene.doc_id = Some(ids::new_local_id());
        let err = store.update_scene("alice", &scene).await.unwrap_err();
        assert!(matches!(err, SyncError::NotMigrated(_)));
    }

    #[tokio::test]
    async fn test_batch_seed_uses_asset_keys() {
        let store = create_test_store().await;
        let defaults = vec![
            Scene::default_scene(0, "Zero", "..."),
            Scene::default_scene(1, "One", "..."),
        ];

        assert_eq!(store.batch_seed_scenes("alice", defaults.clone()).await.unwrap(), 2);
        let ordinals = store.query_existing_default_ordinals("alice").await.unwrap();
        assert_eq!(ordinals.into_iter().collect::<Vec<_>>(), vec![0, 1]);

        let scenes = store.list_scenes("alice").await.unwrap();
        assert_eq!(scenes[0].doc_id.as_deref(), Some("asset_0"));
        assert_eq!(ids::resolve_scene_id(&scenes[1]), "asset_1");

        // Seeding the same ordinals again fails as a unit and adds nothing
        assert!(store.batch_seed_scenes("alice", defaults).await.is_err());
        assert_eq!(store.list_scenes("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_favorites_are_unique() {
        let store = create_test_store().await;
        store.add_favorite("alice", "asset_3", ItemType::Scene).await.unwrap();
        store.add_favorite("alice", "asset_3", ItemType::Scene).await.unwrap();

        assert_eq!(store.list_favorites("alice").await.unwrap().len(), 1);
        assert!(store
            .query_is_favorited("alice", "asset_3", ItemType::Scene)
            .await
            .unwrap());
        assert!(!store
            .query_is_favorited("bob", "asset_3", ItemType::Scene)
            .await
            .unwrap());

        store.remove_favorite("alice", "asset_3", ItemType::Scene).await.unwrap();
        store.remove_favorite("alice", "asset_3", ItemType::Scene).await.unwrap();
        assert!(store.list_favorites("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_upload_roundtrip() {
        let store = create_test_store().await;
        let url = store
            .upload_image("alice", "pose.png", vec![1, 2, 3])
            .await
            .unwrap();
        assert!(url.starts_with(ids::CLOUD_IMAGE_SCHEME));

        assert_eq!(store.download_image("alice", &url).await.unwrap(), vec![1, 2, 3]);
        let err = store.download_image("bob", &url).await.unwrap_err();
        assert!(matches!(err, SyncError::Permission(_)));
    }

    #[tokio::test]
    async fn test_live_query_reaches_subscription() {
        let store = create_test_store().await;
        store.watch_remote_changes().await.unwrap();
        let mut sub = store.subscribe_scenes("alice").await.unwrap();
        assert!(sub.next().await.unwrap().is_empty());

        // Another device writes straight to the database; no local notice
        store
            .db
            .query(
                "CREATE type::thing('scene', ['alice', 'phone1']) CONTENT \
                 { key: 'phone1', owner_id: 'alice', title: 'From phone', content: '', is_custom: true }",
            )
            .await
            .unwrap()
            .check()
            .unwrap();

        let snapshot = tokio::time::timeout(std::time::Duration::from_secs(5), sub.next())
            .await
            .expect("live query notice")
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].title, "From phone");
        assert_eq!(snapshot[0].doc_id.as_deref(), Some("phone1"));
    }

    #[tokio::test]
    async fn test_subscription_emits_full_snapshots() {
        let store = create_test_store().await;
        let mut sub = store.subscribe_scenes("alice").await.unwrap();

        assert!(sub.next().await.unwrap().is_empty());

        store.add_scene("alice", Scene::custom("One", "")).await.unwrap();
        assert_eq!(sub.next().await.unwrap().len(), 1);

        // Another owner's writes do not trigger an emission for alice
        store.add_scene("bob", Scene::custom("Other", "")).await.unwrap();
        store.add_scene("alice", Scene::custom("Two", "")).await.unwrap();
        let snapshot = sub.next().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|s| s.owner_id.as_deref() == Some("alice")));
    }
}
