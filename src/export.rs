//! Export Snapshot Builder
//!
//! A portable copy of the user's own content: custom scenes as they are,
//! custom positions with their image bytes inlined (base64), and the stable
//! ids of favorite scenes and favorite bundled positions. A position whose
//! image cannot be fetched is left out and logged.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::cloud::CloudStore;
use crate::defaults::BundledContent;
use crate::error::{Result, SyncError};
use crate::ids::{resolve_position_id, resolve_scene_id, ImageRef};
use crate::models::{PositionItem, Scene};

pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedScene {
    pub id: String,
    #[serde(flatten)]
    pub scene: Scene,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedPosition {
    pub id: String,
    #[serde(flatten)]
    pub position: PositionItem,
    /// Base64 image payload
    pub image_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub owner_id: Option<String>,
    pub scenes: Vec<ExportedScene>,
    pub positions: Vec<ExportedPosition>,
    pub favorite_scene_ids: Vec<String>,
    pub favorite_asset_position_ids: Vec<String>,
}

impl ExportSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the snapshot as JSON, creating parent directories
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = self.to_json()?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        log::info!("Exported snapshot to {}", path.display());
        Ok(())
    }
}

/// What the authoritative tier currently shows
pub struct ExportInput<'a> {
    pub owner_id: Option<&'a str>,
    pub scenes: &'a [Scene],
    pub positions: &'a [PositionItem],
    pub favorite_scene_ids: &'a [String],
    pub favorite_asset_position_ids: &'a [String],
}

pub struct ExportBuilder {
    cloud: Arc<dyn CloudStore>,
    defaults: Arc<BundledContent>,
    http: reqwest::Client,
}

impl ExportBuilder {
    pub fn new(cloud: Arc<dyn CloudStore>, defaults: Arc<BundledContent>) -> Self {
        let http = match reqwest::Client::builder()
            .user_agent(concat!("scene-studio/", env!("CARGO_PKG_VERSION")))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                log::warn!("Failed to build HTTP client, using defaults: {}", e);
                reqwest::Client::new()
            }
        };
        Self {
            cloud,
            defaults,
            http,
        }
    }

    pub async fn build(&self, input: ExportInput<'_>) -> ExportSnapshot {
        let scenes = input
            .scenes
            .iter()
            .filter(|s| s.is_custom)
            .map(|s| ExportedScene {
                id: resolve_scene_id(s),
                scene: s.clone(),
            })
            .collect();

        let fetches = input
            .positions
            .iter()
            .filter(|p| !p.is_asset)
            .map(|p| self.export_position(input.owner_id, p));
        let positions = join_all(fetches).await.into_iter().flatten().collect();

        ExportSnapshot {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            owner_id: input.owner_id.map(str::to_string),
            scenes,
            positions,
            favorite_scene_ids: input.favorite_scene_ids.to_vec(),
            favorite_asset_position_ids: input.favorite_asset_position_ids.to_vec(),
        }
    }

    async fn export_position(
        &self,
        owner_id: Option<&str>,
        position: &PositionItem,
    ) -> Option<ExportedPosition> {
        let id = resolve_position_id(position);
        match self.fetch_image(owner_id, &position.image_ref).await {
            Ok(bytes) => Some(ExportedPosition {
                id,
                position: position.clone(),
                image_data: BASE64_STANDARD.encode(bytes),
            }),
            Err(e) => {
                log::warn!("Leaving position {} out of export: {}", id, e);
                None
            }
        }
    }

    /// Fetch image bytes according to the form of the reference
    pub async fn fetch_image(&self, owner_id: Option<&str>, image_ref: &str) -> Result<Vec<u8>> {
        match ImageRef::classify(image_ref) {
            ImageRef::Asset(file_name) => Ok(tokio::fs::read(self.defaults.asset_path(&file_name)).await?),
            ImageRef::LocalFile(path) => Ok(tokio::fs::read(path).await?),
            ImageRef::Remote(url) => {
                let response = self.http.get(&url).send().await?.error_for_status()?;
                Ok(response.bytes().await?.to_vec())
            }
            ImageRef::Cloud { .. } => {
                let owner_id = owner_id.ok_or(SyncError::NotAuthenticated)?;
                self.cloud.download_image(owner_id, image_ref).await
            }
            ImageRef::ContentProvider(uri) => Err(SyncError::UnsupportedImage(uri)),
        }
    }
}
