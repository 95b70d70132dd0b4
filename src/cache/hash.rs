//! Content hash of an artifact: its dependency files and build configuration.

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

use crate::build::Builder;
use crate::config::Artifact;
use crate::error::{DevError, Result};

/// Hash the artifact's current dependency set and build configuration.
///
/// Equal inputs always produce the same hash; the cache hits on hash
/// equality alone.
pub async fn artifact_hash(builder: &dyn Builder, artifact: &Artifact) -> Result<String> {
    let deps = builder.dependencies_for_artifact(artifact).await?;
    let config = serde_json::to_vec(&(&artifact.image_name, &artifact.custom))
        .map_err(|e| DevError::Serialize(e.to_string()))?;

    tokio::task::spawn_blocking(move || hash_inputs(deps, &config))
        .await
        .map_err(|e| DevError::Build(format!("hash task failed: {}", e)))?
}

fn hash_inputs(mut deps: Vec<PathBuf>, config: &[u8]) -> Result<String> {
    deps.sort();
    deps.dedup();

    let file_hashes = deps
        .par_iter()
        .map(|path| {
            let bytes = fs::read(path).map_err(|source| DevError::Stat {
                path: path.clone(),
                source,
            })?;
            Ok(Sha256::digest(&bytes))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut hasher = Sha256::new();
    for (path, file_hash) in deps.iter().zip(&file_hashes) {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(file_hash);
    }
    hasher.update(config);
    Ok(hex::encode(hasher.finalize()))
}
