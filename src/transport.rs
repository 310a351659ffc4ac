//! Fetching raw dumps from controllers into the local cache.
//!
//! The cache layout is fixed: one directory per controller holding one
//! `{controller}_{resource}.dat` file per resource. How the bytes get there is up to the
//! [`DumpTransport`].

use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{config::ControllerConfig, error::ForceError, properties::Scope};

pub trait DumpTransport: Sync {
    /// Fetch the dump of every resource of `controller` into `local_dir`, returning the paths
    /// written. `remote_path` is the per-resource location template (`{resource}` substituted).
    fn fetch_files(
        &self,
        controller: &ControllerConfig,
        remote_path: &str,
        local_dir: &Path,
    ) -> impl Future<Output = Result<Vec<PathBuf>, ForceError>> + Send;
}

/// Reads dumps from a locally mounted mirror of the controllers' file systems, laid out as
/// `{root}/{controller}{remote_path}`.
#[derive(Debug, Clone)]
pub struct MirrorTransport {
    root: PathBuf,
}

impl MirrorTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        MirrorTransport { root: root.into() }
    }

    pub fn remote_file(&self, controller: &str, remote_path: &str, resource: &str) -> PathBuf {
        let relative = remote_path.replace("{resource}", resource);
        self.root
            .join(controller)
            .join(relative.trim_start_matches('/'))
    }
}

impl DumpTransport for MirrorTransport {
    #[tracing::instrument(skip(self, controller), fields(controller = %controller.name))]
    async fn fetch_files(
        &self,
        controller: &ControllerConfig,
        remote_path: &str,
        local_dir: &Path,
    ) -> Result<Vec<PathBuf>, ForceError> {
        tracing::debug!(
            "Reading dumps of {} from mirror {:?}",
            controller.endpoint(),
            self.root
        );
        tokio::fs::create_dir_all(local_dir).await?;
        let mut fetched = Vec::with_capacity(controller.resources.len());
        for scope in controller.scopes() {
            let source = self.remote_file(&controller.name, remote_path, &scope.resource);
            let target = local_dir.join(scope.dump_file_name());
            match copy_replacing(&source, &target).await {
                Ok(()) => {
                    tracing::debug!("Fetched {:?} -> {:?}", source, target);
                    fetched.push(target);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::warn!("No dump for {} at {:?}, skipping", scope, source);
                }
                Err(e) => {
                    return Err(ForceError::Transport(format!(
                        "fetching {scope} from {source:?}: {e}"
                    )));
                }
            }
        }
        Ok(fetched)
    }
}

/// Copy through a sibling temp file so a reader never sees a half-written dump.
async fn copy_replacing(source: &Path, target: &Path) -> std::io::Result<()> {
    let partial = target.with_extension("part");
    tokio::fs::copy(source, &partial).await?;
    tokio::fs::rename(&partial, target).await
}

/// Scopes for which a dump is cached in `controller_dir`, from the file naming convention.
/// Files that do not follow it are ignored.
pub fn cached_scopes(controller_dir: &Path) -> Result<Vec<Scope>, ForceError> {
    if !controller_dir.exists() {
        return Ok(Vec::new());
    }
    let mut scopes = Vec::new();
    for entry in walkdir::WalkDir::new(controller_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.file_name().to_str().and_then(Scope::from_dump_file_name) {
            Some(scope) => scopes.push(scope),
            None => tracing::debug!("Ignoring {:?}: not a dump file name", entry.path()),
        }
    }
    Ok(scopes)
}
