//! Bundled default content, loaded once at startup.
//!
//! Default scenes come from a JSON list; their position in the list is their
//! ordinal. Default positions are the image files of a fixed directory, and
//! the filename is their stable id.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::AssetsConfig;
use crate::error::{Result, SyncError};
use crate::models::{PositionItem, Scene};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

#[derive(Debug, Deserialize)]
struct DefaultSceneEntry {
    title: String,
    #[serde(default)]
    content: String,
}

/// Read-only bundle of default scenes and position images
#[derive(Debug, Clone, Default)]
pub struct BundledContent {
    scenes: Vec<Scene>,
    positions: Vec<PositionItem>,
    positions_dir: PathBuf,
}

impl BundledContent {
    pub fn load(config: &AssetsConfig) -> Result<Self> {
        let scenes = Self::load_scenes(&config.scenes_file)?;
        let positions = Self::list_position_assets(&config.positions_dir)?;
        log::info!(
            "Loaded {} default scenes and {} default positions",
            scenes.len(),
            positions.len()
        );

        Ok(Self {
            scenes,
            positions,
            positions_dir: config.positions_dir.clone(),
        })
    }

    pub fn from_parts(scenes: Vec<Scene>, positions: Vec<PositionItem>, positions_dir: PathBuf) -> Self {
        Self {
            scenes,
            positions,
            positions_dir,
        }
    }

    /// Parse the default scene list; ordinals follow list order
    pub fn load_scenes(path: &Path) -> Result<Vec<Scene>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::AssetNotFound(format!("{}: {}", path.display(), e)))?;
        let entries: Vec<DefaultSceneEntry> = serde_json::from_str(&raw)
            .map_err(|e| SyncError::AssetNotFound(format!("{}: {}", path.display(), e)))?;

        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| Scene::default_scene(i as u32, entry.title, entry.content))
            .collect())
    }

    /// Image files of the default position directory, sorted by name
    pub fn list_position_assets(dir: &Path) -> Result<Vec<PositionItem>> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SyncError::AssetNotFound(format!("{}: {}", dir.display(), e)))?;

        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let ext = Path::new(&name)
                    .extension()?
                    .to_string_lossy()
                    .to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(name)
            })
            .collect();
        names.sort();

        Ok(names.into_iter().map(PositionItem::asset).collect())
    }

    /// Fresh copies of the default scenes
    pub fn scenes(&self) -> Vec<Scene> {
        self.scenes.clone()
    }

    pub fn positions(&self) -> Vec<PositionItem> {
        self.positions.clone()
    }

    /// On-disk location of a bundled image
    pub fn asset_path(&self, file_name: &str) -> PathBuf {
        self.positions_dir.join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let scenes_file = dir.path().join("scenes.json");
        std::fs::write(
            &scenes_file,
            r#"[{"title": "Beach", "content": "Waves"}, {"title": "Forest"}]"#,
        )
        .unwrap();
        let positions_dir = dir.path().join("positions");
        std::fs::create_dir(&positions_dir).unwrap();
        std::fs::write(positions_dir.join("b_pose.png"), b"png").unwrap();
        std::fs::write(positions_dir.join("a_pose.JPG"), b"jpg").unwrap();
        std::fs::write(positions_dir.join("notes.txt"), b"skip").unwrap();

        let bundle = BundledContent::load(&AssetsConfig {
            scenes_file,
            positions_dir: positions_dir.clone(),
        })
        .unwrap();

        let scenes = bundle.scenes();
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[1].original_ordinal, Some(1));
        assert_eq!(scenes[1].content, "");
        assert!(!scenes[0].is_custom);

        let positions = bundle.positions();
        let names: Vec<_> = positions.iter().map(|p| p.image_ref.as_str()).collect();
        assert_eq!(names, vec!["a_pose.JPG", "b_pose.png"]);
        assert_eq!(bundle.asset_path("a_pose.JPG"), positions_dir.join("a_pose.JPG"));
    }

    #[test]
    fn test_missing_bundle_is_asset_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = BundledContent::load_scenes(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, SyncError::AssetNotFound(_)));

        let err = BundledContent::list_position_assets(&dir.path().join("none")).unwrap_err();
        assert!(matches!(err, SyncError::AssetNotFound(_)));
    }
}
