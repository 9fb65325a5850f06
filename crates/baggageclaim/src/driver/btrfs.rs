//! btrfs driver.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use baggageclaim_common::{ClaimError, ClaimResult};
use walkdir::WalkDir;

use super::{Driver, run};
use crate::filesystem::{Filesystem, FilesystemVolume, LiveVolume};

/// Inode number of every btrfs subvolume root.
const SUBVOLUME_INODE: u64 = 256;

/// Driver backed by btrfs subvolumes. Copy-on-write is a snapshot.
#[derive(Debug, Clone)]
pub struct BtrfsDriver {
    btrfs_bin: PathBuf,
}

impl BtrfsDriver {
    /// Create a driver using the given `btrfs` binary.
    #[must_use]
    pub fn new(btrfs_bin: impl Into<PathBuf>) -> Self {
        Self {
            btrfs_bin: btrfs_bin.into(),
        }
    }

    fn subvolume(&self) -> Command {
        let mut cmd = Command::new(&self.btrfs_bin);
        cmd.arg("subvolume");
        cmd
    }

    fn delete_subvolume(&self, path: &Path) -> ClaimResult<()> {
        run(self.subvolume().arg("delete").arg(path))
    }
}

/// Nested subvolumes under `root`, excluding `root` itself.
fn nested_subvolumes(root: &Path) -> ClaimResult<Vec<PathBuf>> {
    let mut found = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| ClaimError::Internal {
            message: e.to_string(),
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| ClaimError::Internal {
            message: e.to_string(),
        })?;
        if meta.ino() == SUBVOLUME_INODE {
            found.push(entry.into_path());
        }
    }

    Ok(found)
}

/// Order subvolumes so every nested one comes before its container.
#[must_use]
pub fn deletion_order(mut subvolumes: Vec<PathBuf>) -> Vec<PathBuf> {
    subvolumes.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    subvolumes
}

impl Driver for BtrfsDriver {
    fn name(&self) -> &'static str {
        "btrfs"
    }

    fn create_volume(&self, volume: &dyn FilesystemVolume) -> ClaimResult<()> {
        run(self.subvolume().arg("create").arg(volume.data_path()))
    }

    fn destroy_volume(&self, volume: &dyn FilesystemVolume) -> ClaimResult<()> {
        let data = volume.data_path();
        if fs::symlink_metadata(&data).is_err() {
            return Ok(());
        }

        for nested in deletion_order(nested_subvolumes(&data)?) {
            tracing::debug!(path = %nested.display(), "Deleting nested subvolume");
            self.delete_subvolume(&nested)?;
        }

        self.delete_subvolume(&data)
    }

    fn create_copy_on_write_layer(
        &self,
        child: &dyn FilesystemVolume,
        parent: &LiveVolume,
    ) -> ClaimResult<()> {
        run(self
            .subvolume()
            .arg("snapshot")
            .arg(parent.data_path())
            .arg(child.data_path()))
    }

    fn recover(&self, _filesystem: &Filesystem) -> ClaimResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepest_subvolumes_go_first() {
        let order = deletion_order(vec![
            PathBuf::from("/v/volume/a"),
            PathBuf::from("/v/volume/a/b/c"),
            PathBuf::from("/v/volume/d"),
            PathBuf::from("/v/volume/a/b"),
        ]);
        assert_eq!(
            order,
            [
                PathBuf::from("/v/volume/a/b/c"),
                PathBuf::from("/v/volume/a/b"),
                PathBuf::from("/v/volume/a"),
                PathBuf::from("/v/volume/d"),
            ]
        );
    }
}
