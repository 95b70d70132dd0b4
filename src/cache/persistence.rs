//! Cache file persistence: a flat YAML mapping of content hash to image
//! details.
//!
//! Writes are atomic (write to `.tmp`, then rename) so an interrupted save
//! never leaves a truncated cache behind.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::debug;

use crate::error::{DevError, Result};

/// What a successful build produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, rename = "id", skip_serializing_if = "String::is_empty")]
    pub image_id: String,
}

/// Content hash -> image details.
pub type ArtifactCacheMap = BTreeMap<String, ImageDetails>;

/// Load the cache map. A missing or empty file is an empty cache.
pub fn load(path: &Path) -> Result<ArtifactCacheMap> {
    if !path.exists() {
        return Ok(ArtifactCacheMap::new());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(ArtifactCacheMap::new());
    }
    let map: ArtifactCacheMap = serde_yaml::from_str(&contents)?;
    debug!(path = %path.display(), entries = map.len(), "artifact cache loaded");
    Ok(map)
}

/// Save the cache map, creating parent directories as needed.
pub fn save(path: &Path, map: &ArtifactCacheMap) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let contents =
        serde_yaml::to_string(map).map_err(|e| DevError::Serialize(e.to_string()))?;

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;

    debug!(path = %path.display(), entries = map.len(), "artifact cache saved");
    Ok(())
}
