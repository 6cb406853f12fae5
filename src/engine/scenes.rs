//! Scenes Reconciliation Engine
//!
//! Signed out, the scene list is the bundled defaults plus the scenes the user
//! created locally. Signing in:
//!
//! 1. pushes every locally created scene to the cloud (fresh document id),
//! 2. subscribes to the account's scenes,
//! 3. seeds the bundled defaults once per account when the first emission has
//!    none, guarded by the ordinals already present in the cloud,
//! 4. routes all later writes to the cloud.
//!
//! Signing out only drops the subscription; cloud content is left in place.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    new_view, Family, Forwarder, MigrationLedger, MigrationReport, StatusBoard, SyncStatus, View,
};
use crate::cloud::CloudStore;
use crate::defaults::BundledContent;
use crate::error::{Result, SyncError};
use crate::ids::{self, resolve_scene_id};
use crate::local::LocalStore;
use crate::models::{ItemType, Scene};

/// What happened while entering the signed-in state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SceneSignIn {
    pub migration: MigrationReport,
    /// Default scenes written by this pass
    pub seeded: usize,
}

/// Where scene writes go for the current authentication state
#[derive(Clone)]
enum SceneBackend {
    Local(LocalBackend),
    Cloud(CloudBackend),
}

#[derive(Clone)]
struct LocalBackend {
    local: Arc<LocalStore>,
    defaults: Arc<BundledContent>,
    view: View<Scene>,
}

impl LocalBackend {
    fn snapshot(&self) -> Vec<Scene> {
        let mut scenes = self.defaults.scenes();
        scenes.extend(self.local.load_scenes());
        scenes
    }

    fn publish(&self) {
        self.view.send_replace(self.snapshot());
    }

    fn add(&self, mut scene: Scene) -> Result<Scene> {
        scene.doc_id = Some(ids::new_local_id());
        scene.original_ordinal = None;
        scene.is_custom = true;
        scene.owner_id = None;

        self.local.push_scene(&scene)?;
        self.publish();
        Ok(scene)
    }

    fn update(&self, scene: &Scene) -> Result<()> {
        if !scene.is_custom {
            return Err(SyncError::ReadOnly(resolve_scene_id(scene)));
        }
        if !self.local.replace_scene(scene)? {
            return Err(SyncError::NotFound(resolve_scene_id(scene)));
        }
        self.publish();
        Ok(())
    }

    fn delete(&self, stable_id: &str) -> Result<()> {
        if ids::parse_asset_ordinal(stable_id).is_some() {
            return Err(SyncError::ReadOnly(stable_id.to_string()));
        }
        if !self.local.remove_scene(stable_id)? {
            return Err(SyncError::NotFound(stable_id.to_string()));
        }
        self.publish();
        Ok(())
    }
}

#[derive(Clone)]
struct CloudBackend {
    cloud: Arc<dyn CloudStore>,
    owner_id: String,
}

impl CloudBackend {
    async fn add(&self, mut scene: Scene) -> Result<Scene> {
        scene.doc_id = None;
        scene.original_ordinal = None;
        scene.is_custom = true;
        self.cloud.add_scene(&self.owner_id, scene).await
    }

    async fn update(&self, scene: &Scene) -> Result<()> {
        let id = resolve_scene_id(scene);
        if scene.doc_id.as_deref().map_or(true, ids::is_local_id) {
            return Err(SyncError::NotMigrated(id));
        }
        self.cloud.update_scene(&self.owner_id, scene).await
    }

    async fn delete(&self, stable_id: &str) -> Result<()> {
        if ids::is_local_id(stable_id) {
            return Err(SyncError::NotMigrated(stable_id.to_string()));
        }
        self.cloud.delete_scene(&self.owner_id, stable_id).await
    }
}

pub struct SceneEngine {
    local: Arc<LocalStore>,
    cloud: Arc<dyn CloudStore>,
    defaults: Arc<BundledContent>,
    view: View<Scene>,
    backend: Mutex<SceneBackend>,
    forwarder: Mutex<Option<Forwarder>>,
    migrations: MigrationLedger,
    status: StatusBoard,
}

impl SceneEngine {
    /// Engine in the signed-out state with its list already published
    pub fn new(
        local: Arc<LocalStore>,
        cloud: Arc<dyn CloudStore>,
        defaults: Arc<BundledContent>,
    ) -> Self {
        let view = new_view(Vec::new());
        let backend = LocalBackend {
            local: local.clone(),
            defaults: defaults.clone(),
            view: view.clone(),
        };
        backend.publish();

        let engine = Self {
            local,
            cloud,
            defaults,
            view,
            backend: Mutex::new(SceneBackend::Local(backend)),
            forwarder: Mutex::new(None),
            migrations: MigrationLedger::default(),
            status: StatusBoard::new(Family::Scenes),
        };
        engine.status.set_pending(engine.pending_scenes().len());
        engine
    }

    /// Live scene list of the authoritative tier
    pub fn scenes(&self) -> watch::Receiver<Vec<Scene>> {
        self.view.subscribe()
    }

    pub fn current(&self) -> Vec<Scene> {
        self.view.borrow().clone()
    }

    pub fn find(&self, stable_id: &str) -> Option<Scene> {
        self.view
            .borrow()
            .iter()
            .find(|s| resolve_scene_id(s) == stable_id)
            .cloned()
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

    /// Scenes created while signed out that have not reached the cloud
    pub fn pending_scenes(&self) -> Vec<Scene> {
        self.local
            .load_scenes()
            .into_iter()
            .filter(|s| s.is_custom)
            .collect()
    }

    fn teardown(&self) {
        if self.forwarder.lock().take().is_some() {
            log::debug!("Scene subscription torn down");
        }
    }

    fn local_backend(&self) -> LocalBackend {
        LocalBackend {
            local: self.local.clone(),
            defaults: self.defaults.clone(),
            view: self.view.clone(),
        }
    }

    pub fn enter_signed_out(&self) {
        self.teardown();
        let backend = self.local_backend();
        backend.publish();
        *self.backend.lock() = SceneBackend::Local(backend);

        self.status.set_account(None);
        self.status.set_pending(self.pending_scenes().len());
        log::info!("Scenes: using local tier");
    }

    pub async fn enter_signed_in(&self, owner_id: &str) -> Result<SceneSignIn> {
        if owner_id.trim().is_empty() {
            return Err(SyncError::NotAuthenticated);
        }

        self.teardown();
        *self.backend.lock() = SceneBackend::Cloud(CloudBackend {
            cloud: self.cloud.clone(),
            owner_id: owner_id.to_string(),
        });
        self.status.set_account(Some(owner_id));
        self.status.set_syncing(true);

        let result = self.sign_in_flow(owner_id).await;

        self.status.set_syncing(false);
        match &result {
            Ok(report) => {
                self.status.mark_synced();
                log::info!(
                    "Scenes: signed in as {} ({} migrated, {} failed, {} seeded)",
                    owner_id,
                    report.migration.migrated,
                    report.migration.failed,
                    report.seeded
                );
            }
            Err(e) => self.status.report(e),
        }
        result
    }

    async fn sign_in_flow(&self, owner_id: &str) -> Result<SceneSignIn> {
        let migration = self.migrate_pending(owner_id).await;

        let mut subscription = match self.cloud.subscribe_scenes(owner_id).await {
            Ok(sub) => sub,
            Err(e) => {
                // Never leave the signed-out list on screen for an account
                self.view.send_replace(Vec::new());
                return Err(e);
            }
        };
        let first = subscription.next().await.unwrap_or_default();

        let has_defaults = first.iter().any(|s| !s.is_custom);
        let seeded = if has_defaults {
            if !self.local.is_seeded(owner_id) {
                if let Err(e) = self.local.mark_seeded(owner_id) {
                    self.status.report(&e);
                }
            }
            0
        } else if self.local.is_seeded(owner_id) {
            0
        } else {
            match self.seed_defaults(owner_id).await {
                Ok(count) => count,
                Err(e) => {
                    self.status.report(&e);
                    0
                }
            }
        };

        let first = if seeded > 0 {
            // The seed notice also reaches the forwarder; this avoids an empty flash
            self.cloud.list_scenes(owner_id).await.unwrap_or(first)
        } else {
            first
        };
        self.view.send_replace(first);
        let view = self.view.clone();
        *self.forwarder.lock() = Some(Forwarder::spawn(subscription, move |scenes| {
            view.send_replace(scenes);
        }));

        Ok(SceneSignIn { migration, seeded })
    }

    /// Push locally created scenes to the cloud. Each write runs in its own
    /// task so a superseding transition does not cancel it; the ledger keeps
    /// a later pass from writing the same scene again.
    async fn migrate_pending(&self, owner_id: &str) -> MigrationReport {
        let pending: Vec<String> = self
            .pending_scenes()
            .into_iter()
            .filter_map(|s| s.doc_id)
            .collect();
        let mut report = MigrationReport {
            total: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return report;
        }

        let handles: Vec<_> = pending
            .into_iter()
            .map(|local_id| {
                let cloud = self.cloud.clone();
                let local = self.local.clone();
                let ledger = self.migrations.clone();
                let owner_id = owner_id.to_string();
                tokio::spawn(async move {
                    migrate_scene(cloud, local, ledger, &owner_id, local_id).await
                })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => report.migrated += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    self.status.report(&e);
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!("Scene migration task failed: {}", e);
                }
            }
        }

        if let Some(err) = report.as_error() {
            self.status.report(&err);
        }
        self.status.set_pending(self.pending_scenes().len());
        report
    }

    /// Write the defaults whose ordinals the account does not hold yet
    async fn seed_defaults(&self, owner_id: &str) -> Result<usize> {
        let existing = self.cloud.query_existing_default_ordinals(owner_id).await?;
        let missing: Vec<Scene> = self
            .defaults
            .scenes()
            .into_iter()
            .filter(|s| matches!(s.original_ordinal, Some(o) if !existing.contains(&o)))
            .collect();

        let count = if missing.is_empty() {
            0
        } else {
            self.cloud.batch_seed_scenes(owner_id, missing).await?
        };
        self.local.mark_seeded(owner_id)?;
        Ok(count)
    }

    /// Re-run the entry of the current state (retries migration and seeding)
    pub async fn reload(&self) -> Result<()> {
        let backend = self.backend.lock().clone();
        match backend {
            SceneBackend::Local(_) => {
                self.enter_signed_out();
                Ok(())
            }
            SceneBackend::Cloud(cloud) => self.enter_signed_in(&cloud.owner_id).await.map(|_| ()),
        }
    }

    pub async fn add_scene(&self, title: &str, content: &str) -> Result<Scene> {
        let scene = Scene::custom(title, content);
        let backend = self.backend.lock().clone();
        let result = match backend {
            SceneBackend::Local(local) => local.add(scene),
            SceneBackend::Cloud(cloud) => cloud.add(scene).await,
        };
        if result.is_ok() {
            self.refresh_pending();
        }
        result
    }

    pub async fn update_scene(&self, scene: &Scene) -> Result<()> {
        let backend = self.backend.lock().clone();
        match backend {
            SceneBackend::Local(local) => local.update(scene),
            SceneBackend::Cloud(cloud) => cloud.update(scene).await,
        }
    }

    pub async fn delete_scene(&self, stable_id: &str) -> Result<()> {
        let backend = self.backend.lock().clone();
        let result = match backend {
            SceneBackend::Local(local) => local.delete(stable_id),
            SceneBackend::Cloud(cloud) => cloud.delete(stable_id).await,
        };
        if result.is_ok() {
            self.refresh_pending();
        }
        result
    }

    /// Republish after the local store was reset
    pub fn refresh_local(&self) {
        if let SceneBackend::Local(local) = &*self.backend.lock() {
            local.publish();
        }
        self.refresh_pending();
    }

    fn refresh_pending(&self) {
        self.status.set_pending(self.pending_scenes().len());
    }
}

/// Move one local scene into the cloud tier and retire its local id
async fn migrate_scene(
    cloud: Arc<dyn CloudStore>,
    local: Arc<LocalStore>,
    ledger: MigrationLedger,
    owner_id: &str,
    local_id: String,
) -> Result<()> {
    let _claim = ledger.claim(&local_id).await;

    let doc_id = match ledger.landed(&local_id) {
        Some(doc_id) => doc_id,
        None => {
            // Re-read under the claim: an earlier pass may have finished
            let Some(mut upload) = local
                .load_scenes()
                .into_iter()
                .find(|s| s.doc_id.as_deref() == Some(local_id.as_str()))
            else {
                log::debug!("Scene {} already migrated", local_id);
                return Ok(());
            };
            upload.doc_id = None;
            upload.owner_id = None;

            let stored = cloud.add_scene(owner_id, upload).await?;
            let doc_id = stored.doc_id.unwrap_or_default();
            ledger.record_landed(&local_id, &doc_id);
            doc_id
        }
    };

    if !doc_id.is_empty() {
        local.rename_favorite_id(ItemType::Scene, &local_id, &doc_id)?;
    }
    local.remove_scene(&local_id)?;
    ledger.settle(&local_id);
    log::debug!("Migrated scene {} -> {}", local_id, doc_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::SurrealCloudStore;

    fn bundle() -> Arc<BundledContent> {
        Arc::new(BundledContent::from_parts(
            (0..4)
                .map(|i| Scene::default_scene(i, format!("Default {}", i), "..."))
                .collect(),
            Vec::new(),
            std::path::PathBuf::new(),
        ))
    }

    async fn create_engine() -> (SceneEngine, Arc<LocalStore>, Arc<SurrealCloudStore>) {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let cloud = Arc::new(SurrealCloudStore::new_memory().await.unwrap());
        let engine = SceneEngine::new(local.clone(), cloud.clone(), bundle());
        (engine, local, cloud)
    }

    #[tokio::test]
    async fn test_signed_out_lists_defaults_and_local() {
        let (engine, local, _) = create_engine().await;
        assert_eq!(engine.current().len(), 4);

        let added = engine.add_scene("Foo", "Bar").await.unwrap();
        assert!(ids::is_local_id(added.doc_id.as_deref().unwrap()));
        assert_eq!(engine.current().len(), 5);
        assert_eq!(local.load_scenes().len(), 1);
        assert_eq!(engine.status_snapshot().pending, 1);
    }

    #[tokio::test]
    async fn test_defaults_are_read_only_signed_out() {
        let (engine, _, _) = create_engine().await;
        let default = engine.find("asset_2").unwrap();

        let err = engine.update_scene(&default).await.unwrap_err();
        assert!(matches!(err, SyncError::ReadOnly(_)));
        let err = engine.delete_scene("asset_2").await.unwrap_err();
        assert!(matches!(err, SyncError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_local_edit_and_delete() {
        let (engine, _, _) = create_engine().await;
        let mut scene = engine.add_scene("Foo", "Bar").await.unwrap();
        scene.content = "Baz".into();
        engine.update_scene(&scene).await.unwrap();

        let id = resolve_scene_id(&scene);
        assert_eq!(engine.find(&id).unwrap().content, "Baz");

        engine.delete_scene(&id).await.unwrap();
        assert!(engine.find(&id).is_none());
        assert!(matches!(
            engine.delete_scene(&id).await.unwrap_err(),
            SyncError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_sign_in_seeds_and_migrates() {
        let (engine, local, cloud) = create_engine().await;
        engine.add_scene("Foo", "Bar").await.unwrap();

        let report = engine.enter_signed_in("alice").await.unwrap();
        assert_eq!(report.migration.migrated, 1);
        assert_eq!(report.seeded, 4);
        assert!(local.load_scenes().is_empty());
        assert!(local.is_seeded("alice"));

        let stored = cloud.list_scenes("alice").await.unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored.iter().filter(|s| s.is_custom).count(), 1);
    }

    #[tokio::test]
    async fn test_reseed_guarded_by_ordinals() {
        let (engine, local, cloud) = create_engine().await;
        engine.enter_signed_in("alice").await.unwrap();
        engine.enter_signed_out();

        // A reinstall forgets the local flag but the cloud keeps the data
        local.remove_value("seeded.alice").unwrap();
        let report = engine.enter_signed_in("alice").await.unwrap();
        assert_eq!(report.seeded, 0);
        assert_eq!(cloud.list_scenes("alice").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_existing_defaults_skip_seeding() {
        let (engine, local, cloud) = create_engine().await;
        cloud
            .batch_seed_scenes("alice", vec![Scene::default_scene(1, "Default 1", "...")])
            .await
            .unwrap();

        let report = engine.enter_signed_in("alice").await.unwrap();
        assert_eq!(report.seeded, 0);
        assert!(local.is_seeded("alice"));

        let ordinals = cloud.query_existing_default_ordinals("alice").await.unwrap();
        assert_eq!(ordinals.len(), 1);
        assert_eq!(engine.find("asset_1").unwrap().owner_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_unwritable_seed_flag_still_follows_cloud() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        let local = Arc::new(LocalStore::open(&path).unwrap());
        let cloud = Arc::new(SurrealCloudStore::new_memory().await.unwrap());
        let engine = SceneEngine::new(local.clone(), cloud.clone(), bundle());
        cloud
            .batch_seed_scenes("alice", vec![Scene::default_scene(0, "Default 0", "...")])
            .await
            .unwrap();

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE kv")
            .unwrap();

        let report = engine.enter_signed_in("alice").await.unwrap();
        assert_eq!(report.seeded, 0);
        assert!(!engine.status_snapshot().issues.is_empty());

        // The account's list is on screen, not the signed-out one
        let current = engine.current();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].owner_id.as_deref(), Some("alice"));

        cloud.add_scene("alice", Scene::custom("Later", "")).await.unwrap();
        let mut scenes = engine.scenes();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            scenes.wait_for(|s| s.len() == 2),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_migrated_scene_is_not_written_twice() {
        let (engine, local, cloud) = create_engine().await;
        let added = engine.add_scene("Foo", "Bar").await.unwrap();
        let local_id = added.doc_id.unwrap();

        // The cloud write of an earlier pass succeeded but the local copy stayed
        let stored = cloud.add_scene("alice", Scene::custom("Foo", "Bar")).await.unwrap();
        engine
            .migrations
            .record_landed(&local_id, stored.doc_id.as_deref().unwrap());

        let report = engine.enter_signed_in("alice").await.unwrap();
        assert_eq!(report.migration.migrated, 1);
        assert!(local.load_scenes().is_empty());
        assert!(engine.migrations.landed(&local_id).is_none());

        let custom = cloud
            .list_scenes("alice")
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.is_custom)
            .count();
        assert_eq!(custom, 1);
    }

    #[tokio::test]
    async fn test_cloud_edits_require_document_id() {
        let (engine, _, _) = create_engine().await;
        engine.enter_signed_in("alice").await.unwrap();

        let mut unmigrated = Scene::custom("Foo", "");
        unmigrated.doc_id = Some(ids::new_local_id());
        let err = engine.update_scene(&unmigrated).await.unwrap_err();
        assert!(matches!(err, SyncError::NotMigrated(_)));
        let err = engine
            .delete_scene(unmigrated.doc_id.as_deref().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotMigrated(_)));
    }

    #[tokio::test]
    async fn test_sign_out_hides_cloud_scenes() {
        let (engine, _, cloud) = create_engine().await;
        engine.enter_signed_in("alice").await.unwrap();
        engine.add_scene("Cloud only", "").await.unwrap();

        engine.enter_signed_out();
        assert_eq!(engine.current().len(), 4);
        assert!(engine.current().iter().all(|s| !s.is_custom));
        assert_eq!(cloud.list_scenes("alice").await.unwrap().len(), 5);
    }
}
