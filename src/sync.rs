//! File sync: copy changed files into running containers instead of
//! rebuilding their image.

use async_trait::async_trait;
use glob::Pattern;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::build::BuildResult;
use crate::config::Artifact;
use crate::error::{DevError, Result};
use crate::kubernetes::Cluster;
use crate::process;
use crate::watch::ChangeSet;

/// Files to copy into (and delete from) containers running `image`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncItem {
    /// Fully qualified tag of the running image.
    pub image: String,
    /// Local path -> destination inside the container.
    pub copy: BTreeMap<PathBuf, String>,
    pub delete: BTreeMap<PathBuf, String>,
}

impl SyncItem {
    pub fn is_empty(&self) -> bool {
        self.copy.is_empty() && self.delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.copy.len() + self.delete.len()
    }
}

/// Derive a sync item for `artifact` from its changes.
///
/// `Ok(None)` means the change cannot be synced and needs a rebuild: the
/// artifact has no sync rules, or some changed path matches none of them.
/// A missing previous build of the image is an error.
pub fn new_item(
    artifact: &Artifact,
    changes: &ChangeSet,
    builds: &[BuildResult],
) -> Result<Option<SyncItem>> {
    if !changes.has_changed() || artifact.sync.is_empty() {
        return Ok(None);
    }

    let rules = compile_rules(&artifact.sync)?;
    let changed = changes.added.iter().chain(changes.modified.iter());
    let Some(copy) = intersect(&artifact.context, &rules, changed) else {
        return Ok(None);
    };
    let Some(delete) = intersect(&artifact.context, &rules, changes.deleted.iter()) else {
        return Ok(None);
    };

    let image = builds
        .iter()
        .find(|b| b.image_name == artifact.image_name)
        .map(|b| b.tag.clone())
        .ok_or_else(|| {
            DevError::Sync(format!("no previous build of {} to sync into", artifact.image_name))
        })?;

    Ok(Some(SyncItem { image, copy, delete }))
}

struct Rule {
    pattern: Pattern,
    dest: String,
    has_meta: bool,
}

fn compile_rules(rules: &BTreeMap<String, String>) -> Result<Vec<Rule>> {
    rules
        .iter()
        .map(|(src, dest)| {
            let pattern = Pattern::new(src)
                .map_err(|e| DevError::Sync(format!("sync pattern {}: {}", src, e)))?;
            Ok(Rule {
                pattern,
                dest: dest.clone(),
                has_meta: src.contains(['*', '?', '[']),
            })
        })
        .collect()
}

/// Map every file to its destination, or `None` if one matches no rule.
fn intersect<'a>(
    context: &Path,
    rules: &[Rule],
    files: impl Iterator<Item = &'a PathBuf>,
) -> Option<BTreeMap<PathBuf, String>> {
    let mut mapped = BTreeMap::new();
    for file in files {
        let relative = file.strip_prefix(context).ok()?;
        let rule = rules.iter().find(|r| r.pattern.matches_path(relative))?;
        // A glob source names a directory in the container; the destination
        // is always a Linux path.
        let dest = if rule.has_meta {
            let name = relative.file_name()?.to_string_lossy();
            format!("{}/{}", rule.dest.trim_end_matches('/'), name)
        } else {
            rule.dest.clone()
        };
        mapped.insert(file.clone(), dest);
    }
    Some(mapped)
}

/// Applies sync items to running containers.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn sync(&self, token: &CancellationToken, item: &SyncItem) -> Result<()>;
}

/// [`Syncer`] using `kubectl cp` and `kubectl exec rm`.
pub struct KubectlSyncer {
    cluster: Arc<dyn Cluster>,
    namespaces: Vec<String>,
}

impl KubectlSyncer {
    pub fn new(cluster: Arc<dyn Cluster>, namespaces: Vec<String>) -> Self {
        Self { cluster, namespaces }
    }
}

#[async_trait]
impl Syncer for KubectlSyncer {
    async fn sync(&self, token: &CancellationToken, item: &SyncItem) -> Result<()> {
        if item.is_empty() {
            return Ok(());
        }
        let pods = self
            .cluster
            .list_pods(&self.namespaces)
            .await
            .map_err(|e| DevError::Sync(e.to_string()))?;

        let mut synced = BTreeSet::new();
        for pod in pods.iter().filter(|p| p.is_forwardable()) {
            for container in pod.spec.containers.iter().filter(|c| c.image == item.image) {
                let target = format!("{}/{}", pod.metadata.namespace, pod.metadata.name);
                for (src, dest) in &item.copy {
                    debug!(src = %src.display(), dest = %dest, pod = %target, "copying");
                    let src = src.to_string_lossy();
                    let remote = format!("{}:{}", target, dest);
                    process::run("kubectl", &["cp", &src, &remote, "-c", &container.name], token)
                        .await
                        .map_err(sync_error)?;
                    synced.insert(src.into_owned());
                }
                for (src, dest) in &item.delete {
                    debug!(dest = %dest, pod = %target, "deleting");
                    process::run(
                        "kubectl",
                        &[
                            "exec", &pod.metadata.name, "--namespace", &pod.metadata.namespace,
                            "-c", &container.name, "--", "rm", "-rf", dest,
                        ],
                        token,
                    )
                    .await
                    .map_err(sync_error)?;
                    synced.insert(src.to_string_lossy().into_owned());
                }
            }
        }

        if synced.len() != item.len() {
            return Err(DevError::Sync(format!(
                "no running container for {}; synced {} of {} files",
                item.image,
                synced.len(),
                item.len()
            )));
        }
        info!(image = %item.image, files = item.len(), "synced files");
        Ok(())
    }
}

fn sync_error(e: DevError) -> DevError {
    match e {
        DevError::Cancelled => e,
        other => DevError::Sync(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomBuild;

    fn artifact(rules: &[(&str, &str)]) -> Artifact {
        Artifact {
            image_name: "web".to_string(),
            context: PathBuf::from("/work/web"),
            custom: CustomBuild::default(),
            sync: rules.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn builds() -> Vec<BuildResult> {
        vec![BuildResult {
            image_name: "web".to_string(),
            tag: "web:v1".to_string(),
        }]
    }

    fn changes(added: &[&str], modified: &[&str], deleted: &[&str]) -> ChangeSet {
        let set = |paths: &[&str]| paths.iter().map(PathBuf::from).collect();
        ChangeSet {
            added: set(added),
            modified: set(modified),
            deleted: set(deleted),
        }
    }

    #[test]
    fn test_glob_rule_maps_to_directory() {
        let a = artifact(&[("static/*.css", "/app/static/"), ("index.html", "/app/index.html")]);
        let item = new_item(
            &a,
            &changes(&["/work/web/static/site.css"], &["/work/web/index.html"], &["/work/web/static/old.css"]),
            &builds(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(item.image, "web:v1");
        assert_eq!(item.copy[&PathBuf::from("/work/web/static/site.css")], "/app/static/site.css");
        assert_eq!(item.copy[&PathBuf::from("/work/web/index.html")], "/app/index.html");
        assert_eq!(item.delete[&PathBuf::from("/work/web/static/old.css")], "/app/static/old.css");
        assert_eq!(item.len(), 3);
    }

    #[test]
    fn test_unmatched_path_needs_rebuild() {
        let a = artifact(&[("static/*.css", "/app/static")]);
        let c = changes(&["/work/web/static/site.css"], &["/work/web/main.go"], &[]);
        assert_eq!(new_item(&a, &c, &builds()).unwrap(), None);
    }

    #[test]
    fn test_no_rules_or_no_changes() {
        let c = changes(&["/work/web/a.css"], &[], &[]);
        assert_eq!(new_item(&artifact(&[]), &c, &builds()).unwrap(), None);
        let a = artifact(&[("*.css", "/app")]);
        assert_eq!(new_item(&a, &ChangeSet::default(), &builds()).unwrap(), None);
    }

    #[test]
    fn test_path_outside_context_needs_rebuild() {
        let a = artifact(&[("*.css", "/app")]);
        let c = changes(&["/elsewhere/a.css"], &[], &[]);
        assert_eq!(new_item(&a, &c, &builds()).unwrap(), None);
    }

    #[test]
    fn test_missing_build_is_error() {
        let a = artifact(&[("*.css", "/app")]);
        let c = changes(&["/work/web/a.css"], &[], &[]);
        assert!(matches!(new_item(&a, &c, &[]).unwrap_err(), DevError::Sync(_)));
    }

    #[test]
    fn test_bad_pattern_is_error() {
        let a = artifact(&[("[", "/app")]);
        let c = changes(&["/work/web/a.css"], &[], &[]);
        assert!(matches!(new_item(&a, &c, &builds()).unwrap_err(), DevError::Sync(_)));
    }
}
