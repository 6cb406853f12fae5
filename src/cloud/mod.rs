//! Cloud tier: authenticated, per-account storage with live subscriptions.
//!
//! Every operation is scoped by the signed-in owner id. An empty owner id is
//! rejected with [`SyncError::NotAuthenticated`]; failures are returned to the
//! caller and never retried here.

pub mod surreal;

use std::collections::BTreeSet;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::error::{Result, SyncError};
use crate::models::{Favorite, ItemType, PositionItem, Scene};

pub use surreal::SurrealCloudStore;

/// Push-based view of one owner's collection.
///
/// Each item is the complete current result set, never a delta. Dropping the
/// subscription releases it.
pub struct Subscription<T> {
    inner: BoxStream<'static, Vec<T>>,
}

impl<T> Subscription<T> {
    pub fn new(stream: impl Stream<Item = Vec<T>> + Send + 'static) -> Self {
        Self {
            inner: stream.boxed(),
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Vec<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Reject cloud calls made without a signed-in account
pub fn require_owner(owner_id: &str) -> Result<&str> {
    if owner_id.trim().is_empty() {
        Err(SyncError::NotAuthenticated)
    } else {
        Ok(owner_id)
    }
}

#[async_trait]
pub trait CloudStore: Send + Sync {
    // ==================== SCENES ====================

    async fn subscribe_scenes(&self, owner_id: &str) -> Result<Subscription<Scene>>;

    async fn list_scenes(&self, owner_id: &str) -> Result<Vec<Scene>>;

    /// Store a scene. A missing or local-session document id is replaced by a
    /// freshly assigned one, returned on the stored scene.
    async fn add_scene(&self, owner_id: &str, scene: Scene) -> Result<Scene>;

    async fn update_scene(&self, owner_id: &str, scene: &Scene) -> Result<()>;

    async fn delete_scene(&self, owner_id: &str, doc_id: &str) -> Result<()>;

    /// Write all default scenes as one unit; all succeed or none do.
    async fn batch_seed_scenes(&self, owner_id: &str, scenes: Vec<Scene>) -> Result<usize>;

    async fn query_existing_default_ordinals(&self, owner_id: &str) -> Result<BTreeSet<u32>>;

    // ==================== POSITIONS ====================

    async fn subscribe_positions(&self, owner_id: &str) -> Result<Subscription<PositionItem>>;

    async fn list_positions(&self, owner_id: &str) -> Result<Vec<PositionItem>>;

    async fn add_position(&self, owner_id: &str, position: PositionItem) -> Result<PositionItem>;

    async fn update_position(&self, owner_id: &str, position: &PositionItem) -> Result<()>;

    async fn delete_position(&self, owner_id: &str, doc_id: &str) -> Result<()>;

    /// Upload image bytes; returns the URL the position should reference
    async fn upload_image(&self, owner_id: &str, file_name: &str, bytes: Vec<u8>) -> Result<String>;

    async fn download_image(&self, owner_id: &str, url: &str) -> Result<Vec<u8>>;

    // ==================== FAVORITES ====================

    async fn subscribe_favorites(&self, owner_id: &str) -> Result<Subscription<Favorite>>;

    async fn list_favorites(&self, owner_id: &str) -> Result<Vec<Favorite>>;

    /// No-op when already favorited
    async fn add_favorite(&self, owner_id: &str, item_id: &str, item_type: ItemType) -> Result<()>;

    /// No-op when not favorited
    async fn remove_favorite(&self, owner_id: &str, item_id: &str, item_type: ItemType)
        -> Result<()>;

    async fn query_is_favorited(
        &self,
        owner_id: &str,
        item_id: &str,
        item_type: ItemType,
    ) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_owner() {
        assert!(matches!(require_owner(""), Err(SyncError::NotAuthenticated)));
        assert!(matches!(require_owner("  "), Err(SyncError::NotAuthenticated)));
        assert_eq!(require_owner("alice").unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_subscription_yields_whole_lists() {
        let sub = Subscription::new(futures::stream::iter(vec![vec![1, 2], vec![1, 2, 3]]));
        let emitted: Vec<Vec<i32>> = sub.collect().await;
        assert_eq!(emitted, vec![vec![1, 2], vec![1, 2, 3]]);
    }
}
