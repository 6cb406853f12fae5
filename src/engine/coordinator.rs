//! Content sync coordinator.
//!
//! Owns the three engines and moves them between tiers whenever the auth
//! signal changes. Sign-in runs scenes, then positions, then favorites, so
//! local favorite ids are remapped by the scene migration before the
//! favorites merge reads them.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{watch, Mutex as AsyncMutex};

use super::favorites::FavoriteItems;
use super::scenes::SceneSignIn;
use super::{FavoritesEngine, MigrationReport, PositionEngine, SceneEngine, SyncStatus};
use crate::auth::AuthState;
use crate::cloud::{CloudStore, SurrealCloudStore};
use crate::config::StudioConfig;
use crate::defaults::BundledContent;
use crate::error::Result;
use crate::export::{ExportBuilder, ExportInput, ExportSnapshot};
use crate::local::LocalStore;
use crate::models::ItemType;

/// Per-family outcome of a sign-in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignInReport {
    pub scenes: SceneSignIn,
    pub positions: MigrationReport,
    pub favorites: MigrationReport,
}

pub struct ContentSync {
    local: Arc<LocalStore>,
    scenes: Arc<SceneEngine>,
    positions: Arc<PositionEngine>,
    favorites: Arc<FavoritesEngine>,
    exporter: ExportBuilder,
    state: watch::Sender<AuthState>,
    transition: AsyncMutex<()>,
}

impl ContentSync {
    pub fn new(
        local: Arc<LocalStore>,
        cloud: Arc<dyn CloudStore>,
        defaults: Arc<BundledContent>,
    ) -> Self {
        let scenes = Arc::new(SceneEngine::new(local.clone(), cloud.clone(), defaults.clone()));
        let positions = Arc::new(PositionEngine::new(
            local.clone(),
            cloud.clone(),
            defaults.clone(),
        ));
        let favorites = Arc::new(FavoritesEngine::new(
            local.clone(),
            cloud.clone(),
            positions.clone(),
        ));
        let (state, _) = watch::channel(AuthState::SignedOut);

        Self {
            local,
            scenes,
            positions,
            favorites,
            exporter: ExportBuilder::new(cloud, defaults),
            state,
            transition: AsyncMutex::new(()),
        }
    }

    /// Open the stores described by the configuration
    pub async fn open(config: &StudioConfig) -> Result<Self> {
        let local = Arc::new(LocalStore::open(&config.local_db_path)?);
        let cloud: Arc<dyn CloudStore> = Arc::new(SurrealCloudStore::connect(&config.cloud).await?);
        let defaults = Arc::new(BundledContent::load(&config.assets)?);
        Ok(Self::new(local, cloud, defaults))
    }

    pub fn scenes(&self) -> &SceneEngine {
        &self.scenes
    }

    pub fn positions(&self) -> &PositionEngine {
        &self.positions
    }

    pub fn favorites(&self) -> &FavoritesEngine {
        &self.favorites
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn auth_state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Status of every family, for a notification area
    pub fn status(&self) -> [SyncStatus; 3] {
        [
            self.scenes.status_snapshot(),
            self.positions.status_snapshot(),
            self.favorites.status_snapshot(),
        ]
    }

    pub fn dismiss_issues(&self) {
        self.scenes.dismiss_issues();
        self.positions.dismiss_issues();
        self.favorites.dismiss_issues();
    }

    /// Move every engine to `next`. Returns the sign-in report, if any.
    pub async fn apply(&self, next: AuthState) -> Result<Option<SignInReport>> {
        let _guard = self.transition.lock().await;
        let previous = self.state.borrow().clone();

        match next {
            AuthState::SignedOut => {
                self.enter_signed_out();
                self.state.send_replace(AuthState::SignedOut);
                Ok(None)
            }
            AuthState::SignedIn { owner_id } => {
                if previous.owner_id().is_some() {
                    // Never let one account's subscription overlap the next
                    self.enter_signed_out();
                }
                self.state.send_replace(AuthState::SignedIn {
                    owner_id: owner_id.clone(),
                });
                self.enter_signed_in(&owner_id).await.map(Some)
            }
        }
    }

    fn enter_signed_out(&self) {
        self.scenes.enter_signed_out();
        self.positions.enter_signed_out();
        self.favorites.enter_signed_out();
    }

    async fn enter_signed_in(&self, owner_id: &str) -> Result<SignInReport> {
        let scenes = self.scenes.enter_signed_in(owner_id).await;
        let positions = self.positions.enter_signed_in(owner_id).await;
        let favorites = self.favorites.enter_signed_in(owner_id).await;

        Ok(SignInReport {
            scenes: scenes?,
            positions: positions?,
            favorites: favorites?,
        })
    }

    /// Follow an auth signal until it closes. A newer state supersedes a
    /// transition still in progress; migration writes it started keep going.
    pub async fn run(self: Arc<Self>, mut auth: watch::Receiver<AuthState>) {
        let mut next = auth.borrow_and_update().clone();
        loop {
            tokio::select! {
                result = self.apply(next.clone()) => {
                    if let Err(e) = result {
                        log::warn!("Transition to {:?} incomplete: {}", next, e);
                    }
                    if auth.changed().await.is_err() {
                        break;
                    }
                }
                changed = auth.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    log::debug!("Transition to {:?} superseded", next);
                }
            }
            next = auth.borrow_and_update().clone();
        }
        log::debug!("Auth signal closed");
    }

    /// Retry migration and seeding for the current state
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        let scenes = self.scenes.reload().await;
        let positions = self.positions.reload().await;
        let favorites = match self.auth_state().owner_id() {
            Some(owner_id) => self.favorites.enter_signed_in(owner_id).await.map(|_| ()),
            None => {
                self.favorites.enter_signed_out();
                Ok(())
            }
        };
        scenes?;
        positions?;
        favorites
    }

    /// Drop local custom content and favorites and show the defaults again
    pub fn reset_to_defaults(&self) -> Result<()> {
        self.local.clear_all()?;
        self.scenes.refresh_local();
        self.positions.refresh_local();
        self.favorites.refresh_local();
        Ok(())
    }

    pub async fn toggle_favorite(&self, item_id: &str, item_type: ItemType) -> Result<bool> {
        self.favorites.toggle(item_id, item_type).await
    }

    /// Favorite items among what is on screen now
    pub fn favorite_items(&self) -> FavoriteItems {
        self.favorites
            .resolve(&self.scenes.current(), &self.positions.current())
    }

    pub async fn export(&self) -> ExportSnapshot {
        let state = self.auth_state();
        let scenes = self.scenes.current();
        let positions = self.positions.current();
        let favorite_scene_ids = self.favorites.resolved_scene_ids(&scenes);
        let favorite_asset_position_ids = self.favorites.asset_position_ids();

        self.exporter
            .build(ExportInput {
                owner_id: state.owner_id(),
                scenes: &scenes,
                positions: &positions,
                favorite_scene_ids: &favorite_scene_ids,
                favorite_asset_position_ids: &favorite_asset_position_ids,
            })
            .await
    }

    pub async fn export_to(&self, path: &Path) -> anyhow::Result<ExportSnapshot> {
        let snapshot = self.export().await;
        snapshot.write_to(path)?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::resolve_scene_id;
    use crate::models::{PositionItem, Scene};

    async fn create_sync() -> (Arc<ContentSync>, Arc<LocalStore>, Arc<SurrealCloudStore>) {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let cloud = Arc::new(SurrealCloudStore::new_memory().await.unwrap());
        let defaults = Arc::new(BundledContent::from_parts(
            (0..5)
                .map(|i| Scene::default_scene(i, format!("Scene {}", i), ""))
                .collect(),
            vec![PositionItem::asset("lotus.png")],
            std::path::PathBuf::new(),
        ));
        let sync = Arc::new(ContentSync::new(local.clone(), cloud.clone(), defaults));
        (sync, local, cloud)
    }

    fn signed_in(owner: &str) -> AuthState {
        AuthState::SignedIn {
            owner_id: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn test_favorite_follows_migrated_scene() {
        let (sync, local, cloud) = create_sync().await;
        let foo = sync.scenes().add_scene("Foo", "").await.unwrap();
        let local_id = resolve_scene_id(&foo);
        sync.toggle_favorite(&local_id, ItemType::Scene).await.unwrap();

        sync.apply(signed_in("alice")).await.unwrap();

        let favorites = cloud.list_favorites("alice").await.unwrap();
        assert_eq!(favorites.len(), 1);
        assert_ne!(favorites[0].item_id, local_id);
        let migrated = cloud.list_scenes("alice").await.unwrap();
        assert!(migrated
            .iter()
            .any(|s| s.is_custom && resolve_scene_id(s) == favorites[0].item_id));
        assert!(!local.load_favorite_ids(ItemType::Scene).contains(&local_id));
    }

    #[tokio::test]
    async fn test_switching_accounts_goes_through_sign_out() {
        let (sync, _, _) = create_sync().await;
        sync.apply(signed_in("alice")).await.unwrap();
        sync.scenes().add_scene("Alice only", "").await.unwrap();

        sync.apply(signed_in("bob")).await.unwrap();
        let scenes = sync.scenes().current();
        assert!(scenes.iter().all(|s| s.owner_id.as_deref() == Some("bob")));
        assert!(scenes.iter().all(|s| s.title != "Alice only"));
        assert_eq!(sync.auth_state(), signed_in("bob"));
    }

    #[tokio::test]
    async fn test_reset_to_defaults() {
        let (sync, local, _) = create_sync().await;
        sync.scenes().add_scene("Foo", "").await.unwrap();
        sync.toggle_favorite("asset_1", ItemType::Scene).await.unwrap();
        sync.toggle_favorite("lotus.png", ItemType::Position).await.unwrap();

        sync.reset_to_defaults().unwrap();
        assert_eq!(sync.scenes().current().len(), 5);
        assert!(sync.favorites().current_scene_ids().is_empty());
        assert!(!sync.positions().find("lotus.png").unwrap().is_favorite);
        assert!(local.load_scenes().is_empty());
    }

    #[tokio::test]
    async fn test_run_follows_auth_signal() {
        let (sync, _, cloud) = create_sync().await;
        let auth = crate::auth::AuthProvider::new();
        let task = tokio::spawn(sync.clone().run(auth.subscribe()));

        let mut scenes = sync.scenes().scenes();
        auth.sign_in("carol").unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                scenes.changed().await.unwrap();
                if scenes.borrow().iter().any(|s| s.owner_id.is_some()) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(cloud.list_scenes("carol").await.unwrap().len(), 5);

        drop(auth);
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_export_uses_authoritative_tier() {
        let (sync, _, _) = create_sync().await;
        sync.apply(signed_in("alice")).await.unwrap();
        sync.toggle_favorite("asset_2", ItemType::Scene).await.unwrap();
        sync.toggle_favorite("lotus.png", ItemType::Position).await.unwrap();

        let snapshot = sync.export().await;
        assert_eq!(snapshot.owner_id.as_deref(), Some("alice"));
        assert_eq!(snapshot.favorite_scene_ids, vec!["asset_2".to_string()]);
        assert_eq!(snapshot.favorite_asset_position_ids, vec!["lotus.png".to_string()]);
        assert!(snapshot.scenes.is_empty());
    }
}
