//! Data models for scenes, positions and favorites.
//!
//! The same structures are used by both tiers; which fields are populated
//! depends on where an item currently lives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scene: either a bundled default or a user-created one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    /// Cloud document id, or a `local_` id while the scene only exists locally
    #[serde(default)]
    pub doc_id: Option<String>,

    /// Index into the bundled default list (defaults only)
    #[serde(default)]
    pub original_ordinal: Option<u32>,

    pub title: String,

    pub content: String,

    pub is_custom: bool,

    /// Owning account; `None` while the scene lives in the local tier
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl Scene {
    /// A bundled default scene
    pub fn default_scene(ordinal: u32, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            doc_id: None,
            original_ordinal: Some(ordinal),
            title: title.into(),
            content: content.into(),
            is_custom: false,
            owner_id: None,
        }
    }

    /// A user-created scene that has not been stored anywhere yet
    pub fn custom(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            doc_id: None,
            original_ordinal: None,
            title: title.into(),
            content: content.into(),
            is_custom: true,
            owner_id: None,
        }
    }

    pub fn is_default(&self) -> bool {
        !self.is_custom && self.original_ordinal.is_some()
    }
}

/// A position image, bundled or user-created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionItem {
    #[serde(default)]
    pub doc_id: Option<String>,

    pub display_name: String,

    /// Asset filename, absolute local path or remote URL
    pub image_ref: String,

    pub is_asset: bool,

    #[serde(default)]
    pub owner_id: Option<String>,

    #[serde(default)]
    pub is_favorite: bool,
}

impl PositionItem {
    /// A read-only position backed by a bundled image
    pub fn asset(file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let display_name = std::path::Path::new(&file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
            .unwrap_or_else(|| file_name.clone());
        Self {
            doc_id: None,
            display_name,
            image_ref: file_name,
            is_asset: true,
            owner_id: None,
            is_favorite: false,
        }
    }

    pub fn custom(display_name: impl Into<String>, image_ref: impl Into<String>) -> Self {
        Self {
            doc_id: None,
            display_name: display_name.into(),
            image_ref: image_ref.into(),
            is_asset: false,
            owner_id: None,
            is_favorite: false,
        }
    }
}

/// Kind of item a favorite points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Scene,
    Position,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Scene => "scene",
            ItemType::Position => "position",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scene" => Some(ItemType::Scene),
            "position" => Some(ItemType::Position),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Association between an account and an item it marked as favorite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Favorite {
    pub item_id: String,
    pub item_type: ItemType,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

impl Favorite {
    pub fn new(owner_id: impl Into<String>, item_id: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            item_id: item_id.into(),
            item_type,
            owner_id: owner_id.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_position_display_name() {
        let pos = PositionItem::asset("lotus_pose.png");
        assert_eq!(pos.display_name, "lotus pose");
        assert_eq!(pos.image_ref, "lotus_pose.png");
        assert!(pos.is_asset);
        assert!(pos.owner_id.is_none());
    }

    #[test]
    fn test_scene_constructors() {
        let def = Scene::default_scene(3, "Beach", "Sand");
        assert!(def.is_default());
        let custom = Scene::custom("Foo", "Bar");
        assert!(!custom.is_default());
        assert!(custom.original_ordinal.is_none());
    }

    #[test]
    fn test_item_type_roundtrip() {
        assert_eq!(ItemType::parse("scene"), Some(ItemType::Scene));
        assert_eq!(ItemType::parse(ItemType::Position.as_str()), Some(ItemType::Position));
        assert_eq!(ItemType::parse("tag"), None);
    }
}
