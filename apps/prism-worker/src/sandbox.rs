//! Per-job sandboxes and the shared local resource cache.
//!
//! Blobs are fetched from the shared store once and kept under
//! `<work_dir>/resources/<hash>`; each job links them into its own
//! `<work_dir>/renders/<render_id>/` tree under their logical names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::fs;
use tracing::{debug, warn};

use prism_proto::RenderJob;
use prism_store::Store;

pub struct Sandbox {
    pub root: PathBuf,
    /// The scene file inside the sandbox, as handed to the renderer.
    pub scene_path: PathBuf,
}

impl Sandbox {
    /// Remove the sandbox tree. Failures are logged; the next job is not
    /// affected by a stale directory.
    pub async fn cleanup(&self) {
        remove_job_dir(&self.root).await;
    }
}

/// Best-effort removal of a job's sandbox tree, also used when
/// materialization dies partway through.
pub async fn remove_job_dir(root: &Path) {
    match fs::remove_dir_all(root).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(sandbox = %root.display(), %err, "failed to remove sandbox"),
    }
}

pub fn job_dir(work_dir: &Path, render_id: &str) -> PathBuf {
    sandbox_root(work_dir, render_id)
}

pub fn cache_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("resources")
}

fn sandbox_root(work_dir: &Path, render_id: &str) -> PathBuf {
    work_dir.join("renders").join(render_id)
}

/// Fetch every job resource into the local cache (skipping ones already
/// present) and link them into a fresh sandbox.
pub async fn materialize(store: &Store, work_dir: &Path, job: &RenderJob) -> Result<Sandbox> {
    let cache = cache_dir(work_dir);
    let root = sandbox_root(work_dir, &job.render_id);
    fs::create_dir_all(&cache).await?;
    fs::create_dir_all(&root).await?;

    for resource in &job.resources {
        let cached = cache.join(&resource.hash);
        if !fs::try_exists(&cached).await? {
            let content = store
                .fetch_resource(&resource.hash)
                .await
                .context("resource fetch failed")?
                .ok_or_else(|| anyhow!("resource {} missing from store", resource.hash))?;
            fs::write(&cached, content).await?;
            debug!(hash = %resource.hash, "resource cached locally");
        }
        link_into_sandbox(&cached, &root, &resource.name).await?;
    }

    Ok(Sandbox {
        scene_path: root.join(&job.input_json),
        root,
    })
}

/// Link one cached blob under its logical name, creating intermediate
/// directories for nested names.
async fn link_into_sandbox(cached: &Path, root: &Path, name: &str) -> Result<()> {
    let link = root.join(name);
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::symlink(cached, &link)
        .await
        .with_context(|| format!("failed to link resource {name}"))?;
    Ok(())
}

/// Periodically drop locally cached blobs whose hash no longer exists in
/// the shared store.
pub async fn sweep_cache_loop(store: Store, work_dir: PathBuf, interval: Duration) {
    let cache = cache_dir(&work_dir);
    let mut timer = tokio::time::interval(interval);
    timer.tick().await; // the first tick is immediate; sweep after one period
    loop {
        timer.tick().await;
        debug!("sweeping local resource cache");
        if let Err(err) = sweep_cache_once(&store, &cache).await {
            warn!(%err, "local cache sweep failed");
        }
    }
}

async fn sweep_cache_once(store: &Store, cache: &Path) -> Result<()> {
    let mut entries = fs::read_dir(cache).await?;
    let mut hashes = Vec::new();
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            hashes.push(entry.file_name().to_string_lossy().into_owned());
            paths.push(entry.path());
        }
    }
    if hashes.is_empty() {
        return Ok(());
    }

    let live = store.resources_exist(&hashes).await?;
    for ((hash, path), exists) in hashes.iter().zip(paths).zip(live) {
        if exists {
            continue;
        }
        debug!(%hash, "dropping locally cached blob gone from the store");
        if let Err(err) = fs::remove_file(&path).await {
            warn!(%hash, %err, "failed to remove cached blob");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn links_resources_under_nested_names() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("abc123");
        fs::write(&cached, b"mesh data").await.unwrap();

        let root = dir.path().join("job");
        fs::create_dir_all(&root).await.unwrap();

        link_into_sandbox(&cached, &root, "meshes/teapot.mesh")
            .await
            .unwrap();

        let linked = root.join("meshes/teapot.mesh");
        assert_eq!(fs::read(&linked).await.unwrap(), b"mesh data");
        assert!(fs::symlink_metadata(&linked)
            .await
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn sandbox_paths_are_scoped_by_render_id() {
        let work = Path::new("/tmp/prism");
        assert_eq!(cache_dir(work), Path::new("/tmp/prism/resources"));
        assert_eq!(
            sandbox_root(work, "42"),
            Path::new("/tmp/prism/renders/42")
        );
    }
}
