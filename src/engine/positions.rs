//! Positions Reconciliation Engine
//!
//! Same state machine as scenes, with two twists: defaults are the files of
//! the bundled image directory (never seeded, never owned), and a custom
//! position may reference a local image file that has to be uploaded before
//! the position can live in the cloud.
//!
//! Favorite state is split. Bundled positions keep it in the local favorite
//! set in both states; custom positions carry it on the item itself.

use std::collections::BTreeSet;
use std::path::Path;
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
use crate::ids::{self, resolve_position_id, ImageRef};
use crate::local::LocalStore;
use crate::models::{ItemType, PositionItem};

/// Published list: bundled positions first, then the custom ones of the
/// authoritative tier
struct PositionView {
    local: Arc<LocalStore>,
    defaults: Arc<BundledContent>,
    view: View<PositionItem>,
    customs: Mutex<Vec<PositionItem>>,
}

impl PositionView {
    fn set_customs(&self, customs: Vec<PositionItem>) {
        *self.customs.lock() = customs;
        self.republish();
    }

    fn republish(&self) {
        let favorites = self.local.load_favorite_ids(ItemType::Position);
        let mut items: Vec<PositionItem> = self
            .defaults
            .positions()
            .into_iter()
            .map(|mut p| {
                p.is_favorite = favorites.contains(&p.image_ref);
                p
            })
            .collect();
        items.extend(self.customs.lock().iter().cloned());
        self.view.send_replace(items);
    }
}

#[derive(Clone)]
enum PositionBackend {
    Local,
    Cloud { owner_id: String },
}

pub struct PositionEngine {
    local: Arc<LocalStore>,
    cloud: Arc<dyn CloudStore>,
    defaults: Arc<BundledContent>,
    view: Arc<PositionView>,
    backend: Mutex<PositionBackend>,
    forwarder: Mutex<Option<Forwarder>>,
    migrations: MigrationLedger,
    status: StatusBoard,
}

impl PositionEngine {
    pub fn new(
        local: Arc<LocalStore>,
        cloud: Arc<dyn CloudStore>,
        defaults: Arc<BundledContent>,
    ) -> Self {
        let view = Arc::new(PositionView {
            local: local.clone(),
            defaults: defaults.clone(),
            view: new_view(Vec::new()),
            customs: Mutex::new(Vec::new()),
        });
        view.set_customs(local.load_positions());

        let engine = Self {
            local,
            cloud,
            defaults,
            view,
            backend: Mutex::new(PositionBackend::Local),
            forwarder: Mutex::new(None),
            migrations: MigrationLedger::default(),
            status: StatusBoard::new(Family::Positions),
        };
        engine.refresh_pending();
        engine
    }

    pub fn positions(&self) -> watch::Receiver<Vec<PositionItem>> {
        self.view.view.subscribe()
    }

    pub fn current(&self) -> Vec<PositionItem> {
        self.view.view.borrow().clone()
    }

    pub fn find(&self, stable_id: &str) -> Option<PositionItem> {
        self.view
            .view
            .borrow()
            .iter()
            .find(|p| resolve_position_id(p) == stable_id)
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

    /// Custom positions still held by the local tier
    pub fn pending_positions(&self) -> Vec<PositionItem> {
        self.local
            .load_positions()
            .into_iter()
            .filter(|p| !p.is_asset)
            .collect()
    }

    /// Stable ids of bundled positions marked as favorite
    pub fn favorite_asset_ids(&self) -> BTreeSet<String> {
        self.local.load_favorite_ids(ItemType::Position)
    }

    fn refresh_pending(&self) {
        self.status.set_pending(self.pending_positions().len());
    }

    fn teardown(&self) {
        if self.forwarder.lock().take().is_some() {
            log::debug!("Position subscription torn down");
        }
    }

    fn owner(&self) -> Option<String> {
        match &*self.backend.lock() {
            PositionBackend::Local => None,
            PositionBackend::Cloud { owner_id } => Some(owner_id.clone()),
        }
    }

    pub fn enter_signed_out(&self) {
        self.teardown();
        *self.backend.lock() = PositionBackend::Local;
        self.view.set_customs(self.local.load_positions());

        self.status.set_account(None);
        self.refresh_pending();
        log::info!("Positions: using local tier");
    }

    pub async fn enter_signed_in(&self, owner_id: &str) -> Result<MigrationReport> {
        if owner_id.trim().is_empty() {
            return Err(SyncError::NotAuthenticated);
        }

        self.teardown();
        *self.backend.lock() = PositionBackend::Cloud {
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
                    "Positions: signed in as {} ({} migrated, {} failed)",
                    owner_id,
                    report.migrated,
                    report.failed
                );
            }
            Err(e) => self.status.report(e),
        }
        result
    }

    async fn sign_in_flow(&self, owner_id: &str) -> Result<MigrationReport> {
        let report = self.migrate_pending(owner_id).await;

        let mut subscription = match self.cloud.subscribe_positions(owner_id).await {
            Ok(sub) => sub,
            Err(e) => {
                self.view.set_customs(Vec::new());
                return Err(e);
            }
        };
        let first = subscription.next().await.unwrap_or_default();
        self.view.set_customs(first);

        let view = self.view.clone();
        *self.forwarder.lock() = Some(Forwarder::spawn(subscription, move |items| {
            view.set_customs(items);
        }));

        Ok(report)
    }

    async fn migrate_pending(&self, owner_id: &str) -> MigrationReport {
        let pending: Vec<String> = self
            .pending_positions()
            .into_iter()
            .filter_map(|p| p.doc_id)
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
                    migrate_position(cloud, local, ledger, &owner_id, local_id).await
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
                    log::warn!("Position migration task failed: {}", e);
                }
            }
        }

        if let Some(err) = report.as_error() {
            self.status.report(&err);
        }
        self.refresh_pending();
        report
    }

    /// Re-run the entry of the current state; retries failed uploads
    pub async fn reload(&self) -> Result<()> {
        match self.owner() {
            None => {
                self.enter_signed_out();
                Ok(())
            }
            Some(owner_id) => self.enter_signed_in(&owner_id).await.map(|_| ()),
        }
    }

    pub async fn add_position(&self, display_name: &str, image_ref: &str) -> Result<PositionItem> {
        let position = PositionItem::custom(display_name, image_ref);
        match self.owner() {
            None => {
                let mut position = position;
                position.doc_id = Some(ids::new_local_id());
                self.local.push_position(&position)?;
                self.view.set_customs(self.local.load_positions());
                self.refresh_pending();
                Ok(position)
            }
            Some(owner_id) => {
                let position = upload_if_needed(self.cloud.as_ref(), &owner_id, position).await?;
                self.cloud.add_position(&owner_id, position).await
            }
        }
    }

    pub async fn update_position(&self, position: &PositionItem) -> Result<()> {
        if position.is_asset {
            return Err(SyncError::ReadOnly(position.image_ref.clone()));
        }
        match self.owner() {
            None => {
                if !self.local.replace_position(position)? {
                    return Err(SyncError::NotFound(resolve_position_id(position)));
                }
                self.view.set_customs(self.local.load_positions());
                Ok(())
            }
            Some(owner_id) => {
                if position.doc_id.as_deref().map_or(true, ids::is_local_id) {
                    return Err(SyncError::NotMigrated(resolve_position_id(position)));
                }
                self.cloud.update_position(&owner_id, position).await
            }
        }
    }

    pub async fn delete_position(&self, stable_id: &str) -> Result<()> {
        if self.defaults.positions().iter().any(|p| p.image_ref == stable_id) {
            return Err(SyncError::ReadOnly(stable_id.to_string()));
        }
        match self.owner() {
            None => {
                if !self.local.remove_position(stable_id)? {
                    return Err(SyncError::NotFound(stable_id.to_string()));
                }
                self.view.set_customs(self.local.load_positions());
                self.refresh_pending();
                Ok(())
            }
            Some(owner_id) => {
                if ids::is_local_id(stable_id) {
                    return Err(SyncError::NotMigrated(stable_id.to_string()));
                }
                self.cloud.delete_position(&owner_id, stable_id).await
            }
        }
    }

    /// Flip the favorite flag of a position; returns the new state
    pub async fn toggle_favorite(&self, stable_id: &str) -> Result<bool> {
        let mut position = self
            .find(stable_id)
            .ok_or_else(|| SyncError::NotFound(stable_id.to_string()))?;

        if position.is_asset {
            let now_favorite = !self.local.load_favorite_ids(ItemType::Position).contains(stable_id);
            self.set_asset_favorite(stable_id, now_favorite)?;
            return Ok(now_favorite);
        }

        position.is_favorite = !position.is_favorite;
        self.update_position(&position).await?;
        Ok(position.is_favorite)
    }

    /// Idempotent favorite write for a bundled position
    pub fn set_asset_favorite(&self, file_name: &str, favorite: bool) -> Result<()> {
        let changed = if favorite {
            self.local.add_favorite_id(ItemType::Position, file_name)?
        } else {
            self.local.remove_favorite_id(ItemType::Position, file_name)?
        };
        if changed {
            self.view.republish();
        }
        Ok(())
    }

    /// Republish after the local store was reset
    pub fn refresh_local(&self) {
        if self.owner().is_none() {
            self.view.set_customs(self.local.load_positions());
        } else {
            self.view.republish();
        }
        self.refresh_pending();
    }
}

/// Replace a local image reference with an uploaded copy
async fn upload_if_needed(
    cloud: &dyn CloudStore,
    owner_id: &str,
    mut position: PositionItem,
) -> Result<PositionItem> {
    match ImageRef::classify(&position.image_ref) {
        ImageRef::LocalFile(path) => {
            let bytes = tokio::fs::read(&path).await?;
            let file_name = file_name_of(&path);
            position.image_ref = cloud.upload_image(owner_id, &file_name, bytes).await?;
            Ok(position)
        }
        ImageRef::ContentProvider(uri) => Err(SyncError::UnsupportedImage(uri)),
        ImageRef::Asset(_) | ImageRef::Remote(_) | ImageRef::Cloud { .. } => Ok(position),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string())
}

/// Upload the image (once), create the cloud document, then drop the local copy
async fn migrate_position(
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
            // Re-read under the claim: an earlier pass may have uploaded or finished
            let Some(position) = local
                .load_positions()
                .into_iter()
                .find(|p| p.doc_id.as_deref() == Some(local_id.as_str()))
            else {
                log::debug!("Position {} already migrated", local_id);
                return Ok(());
            };
            let needs_upload = ImageRef::classify(&position.image_ref).needs_upload();

            let mut position = upload_if_needed(cloud.as_ref(), owner_id, position).await?;
            if needs_upload {
                // A failed document write must not upload the image again on retry
                local.replace_position(&position)?;
            }

            position.doc_id = None;
            position.owner_id = None;
            let stored = cloud.add_position(owner_id, position).await?;
            let doc_id = stored.doc_id.unwrap_or_default();
            ledger.record_landed(&local_id, &doc_id);
            doc_id
        }
    };

    local.remove_position(&local_id)?;
    ledger.settle(&local_id);
    log::debug!("Migrated position {} -> {}", local_id, doc_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::SurrealCloudStore;

    fn bundle() -> Arc<BundledContent> {
        Arc::new(BundledContent::from_parts(
            Vec::new(),
            vec![
                PositionItem::asset("lotus.png"),
                PositionItem::asset("warrior.png"),
            ],
            std::path::PathBuf::from("assets/positions"),
        ))
    }

    async fn create_engine() -> (PositionEngine, Arc<LocalStore>, Arc<SurrealCloudStore>) {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let cloud = Arc::new(SurrealCloudStore::new_memory().await.unwrap());
        let engine = PositionEngine::new(local.clone(), cloud.clone(), bundle());
        (engine, local, cloud)
    }

    #[tokio::test]
    async fn test_assets_are_listed_and_read_only() {
        let (engine, _, _) = create_engine().await;
        let current = engine.current();
        assert_eq!(current.len(), 2);
        assert!(current.iter().all(|p| p.is_asset));

        let err = engine.delete_position("lotus.png").await.unwrap_err();
        assert!(matches!(err, SyncError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_asset_favorite_stays_local() {
        let (engine, local, cloud) = create_engine().await;
        engine.enter_signed_in("alice").await.unwrap();

        assert!(engine.toggle_favorite("warrior.png").await.unwrap());
        assert!(engine.find("warrior.png").unwrap().is_favorite);
        assert!(local.load_favorite_ids(ItemType::Position).contains("warrior.png"));
        assert!(cloud.list_favorites("alice").await.unwrap().is_empty());

        assert!(!engine.toggle_favorite("warrior.png").await.unwrap());
        assert!(!engine.find("warrior.png").unwrap().is_favorite);
    }

    #[tokio::test]
    async fn test_local_file_is_uploaded_on_sign_in() {
        let (engine, local, cloud) = create_engine().await;
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("pose.png");
        std::fs::write(&image, b"png-bytes").unwrap();

        let added = engine
            .add_position("Mine", image.to_str().unwrap())
            .await
            .unwrap();
        engine.toggle_favorite(&resolve_position_id(&added)).await.unwrap();

        let report = engine.enter_signed_in("alice").await.unwrap();
        assert_eq!(report.migrated, 1);
        assert!(local.load_positions().is_empty());

        let stored = cloud.list_positions("alice").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_favorite);
        assert!(stored[0].image_ref.starts_with(ids::CLOUD_IMAGE_SCHEME));
        let bytes = cloud.download_image("alice", &stored[0].image_ref).await.unwrap();
        assert_eq!(bytes, b"png-bytes");
    }

    #[tokio::test]
    async fn test_failed_upload_stays_pending() {
        let (engine, local, cloud) = create_engine().await;
        engine
            .add_position("Gone", "/definitely/not/here.png")
            .await
            .unwrap();
        engine
            .add_position("Provider", "content://media/42")
            .await
            .unwrap();

        let report = engine.enter_signed_in("alice").await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(local.load_positions().len(), 2);
        assert!(cloud.list_positions("alice").await.unwrap().is_empty());

        let status = engine.status_snapshot();
        assert_eq!(status.pending, 2);
        assert!(!status.issues.is_empty());
    }

    #[tokio::test]
    async fn test_sign_out_shows_local_customs_only() {
        let (engine, _, _) = create_engine().await;
        engine.enter_signed_in("alice").await.unwrap();
        engine
            .add_position("Remote", "https://example.com/pose.png")
            .await
            .unwrap();

        engine.enter_signed_out();
        assert_eq!(engine.current().len(), 2);
    }
}
