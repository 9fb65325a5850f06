//! overlayfs driver.
//!
//! Every volume owns a layer directory under the overlays root. A root
//! volume's data path is a bind mount of its layer; a copy-on-write volume's
//! data path is an overlay with its own layer as upper and its root
//! ancestor's layer as lower.
//!
//! To keep overlays one level deep, a child of a copy-on-write volume starts
//! with a copy of its parent's layer and is stacked directly on the shared
//! root ancestor. A layer therefore always holds every change relative to
//! the root.

use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;

use baggageclaim_common::{ClaimResult, OverlayPaths};

use super::{Driver, bind_mount, mount_overlay, run, unmount};
use crate::filesystem::{Filesystem, FilesystemVolume, LiveVolume};

/// Driver backed by bind mounts and overlayfs.
#[derive(Debug, Clone)]
pub struct OverlayDriver {
    paths: OverlayPaths,
}

impl OverlayDriver {
    /// Create a driver keeping layers under `paths`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer directories cannot be created.
    pub fn new(paths: OverlayPaths) -> ClaimResult<Self> {
        fs::create_dir_all(&paths.root)?;
        fs::create_dir_all(paths.root.join("work"))?;
        Ok(Self { paths })
    }

    /// The layer layout.
    #[must_use]
    pub const fn paths(&self) -> &OverlayPaths {
        &self.paths
    }

    fn mount_on_root(&self, child: &dyn FilesystemVolume, root_handle: &str) -> ClaimResult<()> {
        let upper = self.paths.layer(child.handle());
        let work = self.paths.work(child.handle());
        fs::create_dir_all(&upper)?;
        fs::create_dir_all(&work)?;
        fs::create_dir_all(child.data_path())?;

        mount_overlay(
            &self.paths.layer(root_handle),
            &upper,
            &work,
            &child.data_path(),
        )
    }
}

/// The volume at the top of `volume`'s parent chain, and how far up it is.
fn root_ancestor(volume: &LiveVolume) -> ClaimResult<(LiveVolume, usize)> {
    let mut current = volume.clone();
    let mut depth = 0;
    while let Some(parent) = current.parent()? {
        current = parent;
        depth += 1;
    }
    Ok((current, depth))
}

fn remove_dir_if_exists(path: &Path) -> ClaimResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl Driver for OverlayDriver {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn create_volume(&self, volume: &dyn FilesystemVolume) -> ClaimResult<()> {
        let layer = self.paths.layer(volume.handle());
        fs::create_dir_all(&layer)?;
        fs::create_dir_all(volume.data_path())?;
        bind_mount(&layer, &volume.data_path())
    }

    fn destroy_volume(&self, volume: &dyn FilesystemVolume) -> ClaimResult<()> {
        unmount(&volume.data_path())?;
        remove_dir_if_exists(&self.paths.work(volume.handle()))?;
        remove_dir_if_exists(&self.paths.layer(volume.handle()))
    }

    fn create_copy_on_write_layer(
        &self,
        child: &dyn FilesystemVolume,
        parent: &LiveVolume,
    ) -> ClaimResult<()> {
        let (root, depth) = root_ancestor(parent)?;

        if depth > 0 {
            let upper = self.paths.layer(child.handle());
            fs::create_dir_all(&upper)?;

            // cp keeps whiteouts and overlay xattrs intact
            let mut source = self.paths.layer(parent.handle()).into_os_string();
            source.push("/.");
            run(Command::new("cp").arg("-a").arg(source).arg(&upper))?;
        }

        tracing::debug!(
            child = child.handle(),
            parent = parent.handle(),
            root = root.handle(),
            "Mounting copy-on-write layer"
        );
        self.mount_on_root(child, root.handle())
    }

    fn recover(&self, filesystem: &Filesystem) -> ClaimResult<()> {
        let mut volumes = Vec::new();
        for volume in filesystem.list_volumes()? {
            let (root, depth) = root_ancestor(&volume)?;
            volumes.push((depth, volume, root));
        }
        volumes.sort_by_key(|(depth, ..)| *depth);

        for (depth, volume, root) in &volumes {
            if *depth == 0 {
                bind_mount(&self.paths.layer(volume.handle()), &volume.data_path())?;
            } else {
                self.mount_on_root(volume, root.handle())?;
            }
        }

        tracing::info!(volumes = volumes.len(), "Recovered overlay mounts");
        Ok(())
    }
}
