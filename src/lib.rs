//! Scene Studio - local/cloud content reconciliation
//!
//! Keeps scenes, positions and favorites consistent across an on-device
//! store and a per-account cloud store, switching tiers on sign-in/sign-out.

pub mod auth;
pub mod cloud;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod export;
pub mod ids;
pub mod local;
pub mod models;

// Re-export commonly used types
pub use auth::{AuthProvider, AuthState};
pub use cloud::{CloudStore, Subscription, SurrealCloudStore};
pub use config::StudioConfig;
pub use defaults::BundledContent;
pub use engine::coordinator::SignInReport;
pub use engine::favorites::FavoriteItems;
pub use engine::scenes::SceneSignIn;
pub use engine::{
    ContentSync, FavoritesEngine, MigrationReport, PositionEngine, SceneEngine, SyncIssue,
    SyncStatus,
};
pub use error::{ErrorKind, Result, SyncError};
pub use export::{ExportBuilder, ExportSnapshot};
pub use ids::{resolve_position_id, resolve_scene_id, ImageRef};
pub use local::LocalStore;
pub use models::{Favorite, ItemType, PositionItem, Scene};
