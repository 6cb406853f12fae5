//! Reconciliation engines.
//!
//! One engine per content family. Each keeps a single authoritative backend
//! per authentication state (local while signed out, cloud while signed in),
//! exposes its item list through a `watch` channel, and aggregates failures
//! on a [`StatusBoard`] instead of tearing down its stream.

pub mod coordinator;
pub mod favorites;
pub mod positions;
pub mod scenes;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::cloud::Subscription;
use crate::error::{ErrorKind, SyncError};

pub use coordinator::ContentSync;
pub use favorites::FavoritesEngine;
pub use positions::PositionEngine;
pub use scenes::SceneEngine;

const MAX_ISSUES: usize = 10;

/// Content family an engine is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Scenes,
    Positions,
    Favorites,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Scenes => f.write_str("scenes"),
            Family::Positions => f.write_str("positions"),
            Family::Favorites => f.write_str("favorites"),
        }
    }
}

/// A failure the user can be told about (and dismiss)
#[derive(Debug, Clone)]
pub struct SyncIssue {
    pub family: Family,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Observable state of one engine
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    /// Account the engine is bound to; `None` while signed out
    pub signed_in_as: Option<String>,
    /// A transition or reload is running
    pub syncing: bool,
    /// Local items still waiting to reach the cloud tier
    pub pending: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub issues: Vec<SyncIssue>,
}

/// Outcome of moving local items into the cloud tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub total: usize,
    pub migrated: usize,
    pub failed: usize,
}

impl MigrationReport {
    pub fn as_error(&self) -> Option<SyncError> {
        (self.failed > 0).then_some(SyncError::PartialMigrationFailure {
            failed: self.failed,
            total: self.total,
        })
    }
}

/// Status channel of one engine
pub struct StatusBoard {
    family: Family,
    tx: watch::Sender<SyncStatus>,
}

impl StatusBoard {
    pub fn new(family: Family) -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self { family, tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn set_account(&self, owner_id: Option<&str>) {
        self.tx.send_modify(|s| s.signed_in_as = owner_id.map(str::to_string));
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.tx.send_modify(|s| s.syncing = syncing);
    }

    pub fn set_pending(&self, pending: usize) {
        self.tx.send_modify(|s| s.pending = pending);
    }

    pub fn mark_synced(&self) {
        self.tx.send_modify(|s| s.last_sync = Some(Utc::now()));
    }

    /// Log a failure; keep it for the user unless it is silent by nature
    pub fn report(&self, error: &SyncError) {
        log::warn!("[{}] {}", self.family, error);
        if !error.is_user_visible() {
            return;
        }

        let issue = SyncIssue {
            family: self.family,
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
        };
        self.tx.send_modify(|s| {
            s.issues.push(issue);
            if s.issues.len() > MAX_ISSUES {
                s.issues.remove(0);
            }
        });
    }

    pub fn dismiss_issues(&self) {
        self.tx.send_modify(|s| s.issues.clear());
    }
}

/// Task pumping a cloud subscription into an engine. Aborted on drop, which
/// also drops the subscription.
pub(crate) struct Forwarder {
    handle: JoinHandle<()>,
}

impl Forwarder {
    pub(crate) fn spawn<T, F>(mut subscription: Subscription<T>, mut sink: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(Vec<T>) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            while let Some(items) = subscription.next().await {
                sink(items);
            }
            log::debug!("Cloud subscription ended");
        });
        Self { handle }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Per-item migration state shared by every sign-in pass of one engine.
///
/// Migration tasks outlive the transition that spawned them, so a later pass
/// can find an item still in flight. Each local id is migrated under its own
/// lock, and an id whose cloud write succeeded is remembered until its local
/// copy is gone.
#[derive(Clone, Default)]
pub(crate) struct MigrationLedger {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    landed: Arc<Mutex<HashMap<String, String>>>,
}

impl MigrationLedger {
    /// Wait until no other task is migrating `local_id`
    pub(crate) async fn claim(&self, local_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .entry(local_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Cloud document id of an item written by an earlier pass
    pub(crate) fn landed(&self, local_id: &str) -> Option<String> {
        self.landed.lock().get(local_id).cloned()
    }

    pub(crate) fn record_landed(&self, local_id: &str, doc_id: &str) {
        self.landed
            .lock()
            .insert(local_id.to_string(), doc_id.to_string());
    }

    pub(crate) fn settle(&self, local_id: &str) {
        self.landed.lock().remove(local_id);
    }
}

/// Shared publisher of an engine's current list
pub(crate) type View<T> = Arc<watch::Sender<Vec<T>>>;

pub(crate) fn new_view<T>(initial: Vec<T>) -> View<T> {
    let (tx, _) = watch::channel(initial);
    Arc::new(tx)
}
