//! Stable item identity across the local and cloud tiers.
//!
//! Every cross-tier equality check goes through [`resolve_scene_id`] or
//! [`resolve_position_id`]. The rule: a real cloud document id wins; otherwise
//! the id derived from the bundled asset; otherwise the transient local id.

use std::path::PathBuf;

use ulid::Ulid;

use crate::models::{PositionItem, Scene};

pub const ASSET_PREFIX: &str = "asset_";
pub const LOCAL_PREFIX: &str = "local_";
pub const CLOUD_IMAGE_SCHEME: &str = "cloud://image/";

/// Id of a bundled default scene, reproducible from the bundle alone.
pub fn asset_scene_id(ordinal: u32) -> String {
    format!("{}{}", ASSET_PREFIX, ordinal)
}

/// Ordinal encoded in an asset scene id.
pub fn parse_asset_ordinal(id: &str) -> Option<u32> {
    id.strip_prefix(ASSET_PREFIX)?.parse().ok()
}

/// Fresh local-session id. Ulids are prefixed by the creation timestamp.
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_PREFIX, Ulid::new())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

/// Fresh key for a cloud document written without an id.
pub fn new_document_key() -> String {
    Ulid::new().to_string().to_lowercase()
}

fn cloud_doc_id(doc_id: &Option<String>) -> Option<&str> {
    doc_id
        .as_deref()
        .filter(|id| !id.is_empty() && !is_local_id(id))
}

pub fn resolve_scene_id(scene: &Scene) -> String {
    if let Some(id) = cloud_doc_id(&scene.doc_id) {
        return id.to_string();
    }
    if let Some(ordinal) = scene.original_ordinal {
        return asset_scene_id(ordinal);
    }
    scene.doc_id.clone().unwrap_or_default()
}

pub fn resolve_position_id(position: &PositionItem) -> String {
    if let Some(id) = cloud_doc_id(&position.doc_id) {
        return id.to_string();
    }
    if position.is_asset {
        return position.image_ref.clone();
    }
    position.doc_id.clone().unwrap_or_default()
}

/// URL under which an uploaded image is addressed.
pub fn cloud_image_url(owner_id: &str, key: &str) -> String {
    format!("{}{}/{}", CLOUD_IMAGE_SCHEME, owner_id, key)
}

/// The forms a position's `image_ref` can take, told apart by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Filename inside the bundled image directory
    Asset(String),
    LocalFile(PathBuf),
    /// http(s) URL
    Remote(String),
    /// Image blob held by the cloud store
    Cloud { owner_id: String, key: String },
    ContentProvider(String),
}

impl ImageRef {
    pub fn classify(image_ref: &str) -> Self {
        if let Some(rest) = image_ref.strip_prefix(CLOUD_IMAGE_SCHEME) {
            if let Some((owner, key)) = rest.split_once('/') {
                return ImageRef::Cloud {
                    owner_id: owner.to_string(),
                    key: key.to_string(),
                };
            }
        }
        if image_ref.starts_with("http://") || image_ref.starts_with("https://") {
            ImageRef::Remote(image_ref.to_string())
        } else if image_ref.starts_with("content://") {
            ImageRef::ContentProvider(image_ref.to_string())
        } else if let Some(path) = image_ref.strip_prefix("file://") {
            ImageRef::LocalFile(PathBuf::from(path))
        } else if image_ref.starts_with('/') {
            ImageRef::LocalFile(PathBuf::from(image_ref))
        } else {
            ImageRef::Asset(image_ref.to_string())
        }
    }

    /// Whether the image has to be uploaded before the item can live in the cloud.
    pub fn needs_upload(&self) -> bool {
        matches!(self, ImageRef::LocalFile(_) | ImageRef::ContentProvider(_))
    }
}
