//! Where manifests and bundles come from.
//!
//! Fetching over the network is the host's business; the controller only
//! needs a [`SnapLocation`] per snap id. Two implementations ship here:
//! [`LocalLocation`] for `local:` directories and [`InMemoryLocations`] for
//! embedding hosts and tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use snaps_core::{SnapId, SnapManifest};
use tracing::debug;

use crate::error::{SnapError, SnapResult};

/// Manifest file name inside a local snap directory.
pub const MANIFEST_FILE: &str = "snap.manifest.json";

/// Fetches one snap's manifest and files.
#[async_trait]
pub trait SnapLocation: Send + Sync {
    /// The snap's manifest, parsed and structurally validated.
    async fn manifest(&self) -> SnapResult<SnapManifest>;

    /// A file relative to the snap's root, usually the bundle.
    async fn fetch(&self, path: &str) -> SnapResult<Vec<u8>>;
}

/// Resolves a snap id to its location.
pub trait LocationFactory: Send + Sync {
    /// The location for `snap_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::Fetch`] for ids this factory cannot serve.
    fn create(&self, snap_id: &SnapId) -> SnapResult<Box<dyn SnapLocation>>;
}

/// A snap living in a directory on disk.
#[derive(Debug, Clone)]
pub struct LocalLocation {
    root: PathBuf,
}

impl LocalLocation {
    /// Serve files from `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The snap directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> SnapResult<PathBuf> {
        let relative = Path::new(path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SnapError::Fetch(format!(
                "path escapes the snap directory: {path}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SnapLocation for LocalLocation {
    async fn manifest(&self) -> SnapResult<SnapManifest> {
        let bytes = self.fetch(MANIFEST_FILE).await?;
        Ok(SnapManifest::from_json(&bytes)?)
    }

    async fn fetch(&self, path: &str) -> SnapResult<Vec<u8>> {
        let full = self.resolve(path)?;
        debug!(path = %full.display(), "Reading snap file");
        tokio::fs::read(&full)
            .await
            .map_err(|e| SnapError::Fetch(format!("{}: {e}", full.display())))
    }
}

/// Serves `local:` ids from the filesystem and refuses everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLocationFactory;

impl LocationFactory for LocalLocationFactory {
    fn create(&self, snap_id: &SnapId) -> SnapResult<Box<dyn SnapLocation>> {
        if snap_id.scheme() != "local" {
            return Err(SnapError::Fetch(format!(
                "no location handler for '{}' ids",
                snap_id.scheme()
            )));
        }
        Ok(Box::new(LocalLocation::new(snap_id.location())))
    }
}

#[derive(Clone)]
struct Published {
    manifest: SnapManifest,
    files: BTreeMap<String, Vec<u8>>,
}

/// A process-local package registry. Publishing again replaces the previous
/// version, which is how tests stage updates.
#[derive(Clone, Default)]
pub struct InMemoryLocations {
    published: Arc<Mutex<HashMap<SnapId, Published>>>,
}

impl std::fmt::Debug for InMemoryLocations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("InMemoryLocations")
            .field("published", &count)
            .finish()
    }
}

impl InMemoryLocations {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `manifest` with `bundle` stored at the manifest's source path.
    pub fn publish(&self, snap_id: SnapId, manifest: SnapManifest, bundle: Vec<u8>) {
        let files = BTreeMap::from([(manifest.source.location.file_path.clone(), bundle)]);
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snap_id, Published { manifest, files });
    }

    /// Withdraw a snap.
    pub fn unpublish(&self, snap_id: &SnapId) -> bool {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(snap_id)
            .is_some()
    }
}

impl LocationFactory for InMemoryLocations {
    fn create(&self, snap_id: &SnapId) -> SnapResult<Box<dyn SnapLocation>> {
        let published = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(snap_id)
            .cloned()
            .ok_or_else(|| SnapError::Fetch(format!("{snap_id} is not published")))?;
        Ok(Box::new(InMemoryLocation(published)))
    }
}

struct InMemoryLocation(Published);

#[async_trait]
impl SnapLocation for InMemoryLocation {
    async fn manifest(&self) -> SnapResult<SnapManifest> {
        self.0.manifest.validate()?;
        Ok(self.0.manifest.clone())
    }

    async fn fetch(&self, path: &str) -> SnapResult<Vec<u8>> {
        self.0
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SnapError::Fetch(format!("no such file: {path}")))
    }
}
