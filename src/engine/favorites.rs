//! Favorites Reconciliation Engine
//!
//! Scene favorites live in the local id set while signed out and in the
//! cloud favorite collection while signed in. Position favorites are handed
//! to the [`PositionEngine`], which keeps them on the items themselves (or in
//! the local set for bundled positions).
//!
//! On sign-in the local scene favorites are merged into the cloud set. The
//! local set is left as it is, so signing out shows it again.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Family, Forwarder, MigrationReport, PositionEngine, StatusBoard, SyncStatus};
use crate::cloud::CloudStore;
use crate::error::{Result, SyncError};
use crate::ids::{self, resolve_position_id, resolve_scene_id};
use crate::local::LocalStore;
use crate::models::{ItemType, PositionItem, Scene};

#[derive(Clone)]
enum FavoritesBackend {
    Local,
    Cloud { owner_id: String },
}

/// Favorite items resolved against the lists currently on screen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FavoriteItems {
    pub scenes: Vec<Scene>,
    pub positions: Vec<PositionItem>,
}

pub struct FavoritesEngine {
    local: Arc<LocalStore>,
    cloud: Arc<dyn CloudStore>,
    positions: Arc<PositionEngine>,
    scene_ids: Arc<watch::Sender<BTreeSet<String>>>,
    backend: Mutex<FavoritesBackend>,
    forwarder: Mutex<Option<Forwarder>>,
    status: StatusBoard,
}

impl FavoritesEngine {
    pub fn new(
        local: Arc<LocalStore>,
        cloud: Arc<dyn CloudStore>,
        positions: Arc<PositionEngine>,
    ) -> Self {
        let (tx, _) = watch::channel(local.load_favorite_ids(ItemType::Scene));
        Self {
            local,
            cloud,
            positions,
            scene_ids: Arc::new(tx),
            backend: Mutex::new(FavoritesBackend::Local),
            forwarder: Mutex::new(None),
            status: StatusBoard::new(Family::Favorites),
        }
    }

    /// Stable ids of favorited scenes in the authoritative tier
    pub fn scene_favorites(&self) -> watch::Receiver<BTreeSet<String>> {
        self.scene_ids.subscribe()
    }

    pub fn current_scene_ids(&self) -> BTreeSet<String> {
        self.scene_ids.borrow().clone()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status_snapshot(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn dismiss_issues(&self) {
        self.status.dismiss_issues();
    }

    fn owner(&self) -> Option<String> {
        match &*self.backend.lock() {
            FavoritesBackend::Local => None,
            FavoritesBackend::Cloud { owner_id } => Some(owner_id.clone()),
        }
    }

    fn teardown(&self) {
        if self.forwarder.lock().take().is_some() {
            log::debug!("Favorite subscription torn down");
        }
    }

    fn publish_local(&self) {
        self.scene_ids
            .send_replace(self.local.load_favorite_ids(ItemType::Scene));
    }

    pub fn enter_signed_out(&self) {
        self.teardown();
        *self.backend.lock() = FavoritesBackend::Local;
        self.publish_local();
        self.status.set_account(None);
        log::info!("Favorites: using local tier");
    }

    /// Merge local scene favorites into the account, then follow the cloud set
    pub async fn enter_signed_in(&self, owner_id: &str) -> Result<MigrationReport> {
        if owner_id.trim().is_empty() {
            return Err(SyncError::NotAuthenticated);
        }

        self.teardown();
        *self.backend.lock() = FavoritesBackend::Cloud {
            owner_id: owner_id.to_string(),
        };
        self.status.set_account(Some(owner_id));
        self.status.set_syncing(true);

        let result = self.sign_in_flow(owner_id).await;

        self.status.set_syncing(false);
        match &result {
            Ok(report) => {
                self.status.mark_synced();
                log::info!(
                    "Favorites: signed in as {} ({} of {} local favorites merged)",
                    owner_id,
                    report.migrated,
                    report.total
                );
            }
            Err(e) => self.status.report(e),
        }
        result
    }

    async fn sign_in_flow(&self, owner_id: &str) -> Result<MigrationReport> {
        let cloud_ids = match self.cloud.list_favorites(owner_id).await {
            Ok(favorites) => scene_ids_of(favorites.into_iter().map(|f| (f.item_type, f.item_id))),
            Err(e) => {
                self.scene_ids.send_replace(BTreeSet::new());
                return Err(e);
            }
        };

        // Ids of scenes that never reached the cloud cannot be matched there
        let local_only: Vec<String> = self
            .local
            .load_favorite_ids(ItemType::Scene)
            .into_iter()
            .filter(|id| !ids::is_local_id(id) && !cloud_ids.contains(id))
            .collect();

        let mut report = MigrationReport {
            total: local_only.len(),
            ..Default::default()
        };
        let mut merged = cloud_ids;
        for item_id in local_only {
            match self.cloud.add_favorite(owner_id, &item_id, ItemType::Scene).await {
                Ok(()) => {
                    report.migrated += 1;
                    merged.insert(item_id);
                }
                Err(e) => {
                    report.failed += 1;
                    self.status.report(&e);
                }
            }
        }
        if let Some(err) = report.as_error() {
            self.status.report(&err);
        }

        let mut subscription = match self.cloud.subscribe_favorites(owner_id).await {
            Ok(sub) => sub,
            Err(e) => {
                self.scene_ids.send_replace(BTreeSet::new());
                return Err(e);
            }
        };
        let first = match subscription.next().await {
            Some(favorites) => scene_ids_of(favorites.into_iter().map(|f| (f.item_type, f.item_id))),
            None => merged,
        };
        self.scene_ids.send_replace(first);

        let scene_ids = self.scene_ids.clone();
        *self.forwarder.lock() = Some(Forwarder::spawn(subscription, move |favorites| {
            scene_ids.send_replace(scene_ids_of(
                favorites.into_iter().map(|f| (f.item_type, f.item_id)),
            ));
        }));

        Ok(report)
    }

    pub async fn is_favorite(&self, item_id: &str, item_type: ItemType) -> Result<bool> {
        match item_type {
            ItemType::Position => Ok(self
                .positions
                .find(item_id)
                .map(|p| p.is_favorite)
                .unwrap_or(false)),
            ItemType::Scene => match self.owner() {
                None => Ok(self.local.load_favorite_ids(ItemType::Scene).contains(item_id)),
                Some(owner_id) => {
                    self.cloud
                        .query_is_favorited(&owner_id, item_id, ItemType::Scene)
                        .await
                }
            },
        }
    }

    /// Idempotent: favoriting twice leaves one favorite
    pub async fn add(&self, item_id: &str, item_type: ItemType) -> Result<()> {
        self.set(item_id, item_type, true).await
    }

    /// Idempotent: removing an absent favorite is a no-op
    pub async fn remove(&self, item_id: &str, item_type: ItemType) -> Result<()> {
        self.set(item_id, item_type, false).await
    }

    /// Flip the favorite state; returns the new state
    pub async fn toggle(&self, item_id: &str, item_type: ItemType) -> Result<bool> {
        if item_type == ItemType::Position {
            return self.positions.toggle_favorite(item_id).await;
        }
        let favorite = !self.is_favorite(item_id, item_type).await?;
        self.set(item_id, item_type, favorite).await?;
        Ok(favorite)
    }

    async fn set(&self, item_id: &str, item_type: ItemType, favorite: bool) -> Result<()> {
        if item_type == ItemType::Position {
            let current = self
                .positions
                .find(item_id)
                .ok_or_else(|| SyncError::NotFound(item_id.to_string()))?;
            if current.is_favorite != favorite {
                self.positions.toggle_favorite(item_id).await?;
            }
            return Ok(());
        }

        match self.owner() {
            None => {
                if favorite {
                    self.local.add_favorite_id(ItemType::Scene, item_id)?;
                } else {
                    self.local.remove_favorite_id(ItemType::Scene, item_id)?;
                }
                self.publish_local();
            }
            Some(owner_id) => {
                if favorite {
                    self.cloud
                        .add_favorite(&owner_id, item_id, ItemType::Scene)
                        .await?;
                } else {
                    self.cloud
                        .remove_favorite(&owner_id, item_id, ItemType::Scene)
                        .await?;
                }
                self.scene_ids.send_modify(|ids| {
                    if favorite {
                        ids.insert(item_id.to_string());
                    } else {
                        ids.remove(item_id);
                    }
                });
            }
        }
        Ok(())
    }

    /// Favorite scenes and positions among the given lists
    pub fn resolve(&self, scenes: &[Scene], positions: &[PositionItem]) -> FavoriteItems {
        let scene_ids = self.scene_ids.borrow();
        FavoriteItems {
            scenes: scenes
                .iter()
                .filter(|s| scene_ids.contains(&resolve_scene_id(s)))
                .cloned()
                .collect(),
            positions: positions.iter().filter(|p| p.is_favorite).cloned().collect(),
        }
    }

    /// Favorite scene ids that match a scene in `scenes`
    pub fn resolved_scene_ids(&self, scenes: &[Scene]) -> Vec<String> {
        let scene_ids = self.scene_ids.borrow();
        scenes
            .iter()
            .map(resolve_scene_id)
            .filter(|id| scene_ids.contains(id))
            .collect()
    }

    /// Favorite bundled positions, by file name
    pub fn asset_position_ids(&self) -> Vec<String> {
        self.positions
            .current()
            .iter()
            .filter(|p| p.is_asset && p.is_favorite)
            .map(resolve_position_id)
            .collect()
    }

    /// Republish after the local store was reset
    pub fn refresh_local(&self) {
        if self.owner().is_none() {
            self.publish_local();
        }
    }
}

fn scene_ids_of(favorites: impl Iterator<Item = (ItemType, String)>) -> BTreeSet<String> {
    favorites
        .filter(|(item_type, _)| *item_type == ItemType::Scene)
        .map(|(_, id)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::SurrealCloudStore;
    use crate::defaults::BundledContent;

    async fn create_engine() -> (FavoritesEngine, Arc<LocalStore>, Arc<SurrealCloudStore>) {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let cloud = Arc::new(SurrealCloudStore::new_memory().await.unwrap());
        let defaults = Arc::new(BundledContent::from_parts(
            vec![Scene::default_scene(0, "Beach", "")],
            vec![PositionItem::asset("lotus.png")],
            std::path::PathBuf::new(),
        ));
        let positions = Arc::new(PositionEngine::new(local.clone(), cloud.clone(), defaults));
        let engine = FavoritesEngine::new(local.clone(), cloud.clone(), positions);
        (engine, local, cloud)
    }

    #[tokio::test]
    async fn test_toggle_twice_restores_state() {
        let (engine, _, _) = create_engine().await;
        assert!(engine.toggle("asset_0", ItemType::Scene).await.unwrap());
        assert!(!engine.toggle("asset_0", ItemType::Scene).await.unwrap());
        assert!(engine.current_scene_ids().is_empty());
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let (engine, local, cloud) = create_engine().await;
        engine.add("asset_0", ItemType::Scene).await.unwrap();
        engine.add("asset_0", ItemType::Scene).await.unwrap();
        assert_eq!(local.load_favorite_ids(ItemType::Scene).len(), 1);

        engine.enter_signed_in("alice").await.unwrap();
        engine.add("asset_0", ItemType::Scene).await.unwrap();
        engine.add("asset_0", ItemType::Scene).await.unwrap();
        assert_eq!(cloud.list_favorites("alice").await.unwrap().len(), 1);

        engine.remove("asset_0", ItemType::Scene).await.unwrap();
        engine.remove("asset_0", ItemType::Scene).await.unwrap();
        assert!(cloud.list_favorites("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_keeps_local_set() {
        let (engine, local, cloud) = create_engine().await;
        engine.add("asset_0", ItemType::Scene).await.unwrap();
        local
            .add_favorite_id(ItemType::Scene, &ids::new_local_id())
            .unwrap();

        let report = engine.enter_signed_in("alice").await.unwrap();
        assert_eq!(report.migrated, 1);
        let ids = engine.current_scene_ids();
        assert!(ids.contains("asset_0"));
        assert_eq!(ids.len(), 1);
        assert_eq!(cloud.list_favorites("alice").await.unwrap().len(), 1);

        engine.enter_signed_out();
        assert!(engine.current_scene_ids().contains("asset_0"));
    }

    #[tokio::test]
    async fn test_position_favorites_are_delegated() {
        let (engine, _, cloud) = create_engine().await;
        engine.enter_signed_in("alice").await.unwrap();

        assert!(engine.toggle("lotus.png", ItemType::Position).await.unwrap());
        assert!(engine.is_favorite("lotus.png", ItemType::Position).await.unwrap());
        engine.add("lotus.png", ItemType::Position).await.unwrap();
        assert_eq!(engine.asset_position_ids(), vec!["lotus.png".to_string()]);
        assert!(cloud.list_favorites("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_against_scene_list() {
        let (engine, _, _) = create_engine().await;
        engine.add("asset_0", ItemType::Scene).await.unwrap();
        engine.add("gone", ItemType::Scene).await.unwrap();

        let scenes = vec![Scene::default_scene(0, "Beach", ""), Scene::custom("Foo", "")];
        let resolved = engine.resolve(&scenes, &[]);
        assert_eq!(resolved.scenes.len(), 1);
        assert_eq!(engine.resolved_scene_ids(&scenes), vec!["asset_0".to_string()]);
    }
}
