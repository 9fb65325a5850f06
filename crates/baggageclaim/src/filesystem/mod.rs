//! Volume directory lifecycle on top of a [`Driver`].
//!
//! This module handles:
//! - Creating volumes in the `init` state
//! - Looking up and listing `live` volumes
//! - Moving volumes through `dead` on destruction
//!
//! Nothing here locks; callers serialize work per handle.

mod volume;

use std::fs;
use std::io;
use std::sync::Arc;

use baggageclaim_common::handle::validate;
use baggageclaim_common::{ClaimError, ClaimResult, VolumePaths};

use crate::driver::Driver;
use crate::volume::Properties;

pub use volume::{DeadVolume, FilesystemVolume, InitVolume, LiveVolume};

/// Volume directories under one root, backed by one driver.
#[derive(Debug, Clone)]
pub struct Filesystem {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    paths: VolumePaths,
    driver: Arc<dyn Driver>,
}

impl Filesystem {
    /// Open a volume root, creating its state directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn new(paths: VolumePaths, driver: Arc<dyn Driver>) -> ClaimResult<Self> {
        paths.create_dirs()?;
        tracing::debug!(root = %paths.root.display(), driver = driver.name(), "Opened volume root");
        Ok(Self {
            inner: Arc::new(Inner { paths, driver }),
        })
    }

    /// The on-disk layout.
    #[must_use]
    pub fn paths(&self) -> &VolumePaths {
        &self.inner.paths
    }

    /// The driver backing this filesystem.
    #[must_use]
    pub fn driver(&self) -> &dyn Driver {
        self.inner.driver.as_ref()
    }

    /// Create an empty volume in the `init` state.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeAlreadyExists`] if the handle is in use,
    /// or the driver error. A volume that fails to set up is removed.
    pub fn new_volume(&self, handle: &str) -> ClaimResult<InitVolume> {
        let volume = self.new_init_dir(handle)?;

        if let Err(err) = self.driver().create_volume(&volume) {
            if let Err(cleanup) = volume.destroy() {
                tracing::error!(handle, error = %cleanup, "Failed to clean up volume");
            }
            return Err(err);
        }

        Ok(volume)
    }

    /// Create the `init` directory and empty properties for `handle`,
    /// without asking the driver for any storage.
    pub(crate) fn new_init_dir(&self, handle: &str) -> ClaimResult<InitVolume> {
        validate(handle)?;

        if self.paths().live_volume(handle).exists() {
            return Err(ClaimError::VolumeAlreadyExists {
                handle: handle.to_string(),
            });
        }

        let dir = self.paths().init_volume(handle);
        fs::create_dir(&dir).map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                ClaimError::VolumeAlreadyExists {
                    handle: handle.to_string(),
                }
            } else {
                ClaimError::Io(err)
            }
        })?;

        let volume = InitVolume::new(self.clone(), handle.to_string(), dir);
        if let Err(err) = volume.store_properties(&Properties::new()) {
            // no driver state yet, so the directory is all there is
            let _ = fs::remove_dir_all(volume.dir());
            return Err(err);
        }

        Ok(volume)
    }

    /// Find a live volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the live directory cannot be inspected.
    pub fn lookup_volume(&self, handle: &str) -> ClaimResult<Option<LiveVolume>> {
        if validate(handle).is_err() {
            return Ok(None);
        }

        let dir = self.paths().live_volume(handle);
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => Ok(Some(LiveVolume::new(
                self.clone(),
                handle.to_string(),
                dir,
            ))),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Every live volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the live directory cannot be read.
    pub fn list_volumes(&self) -> ClaimResult<Vec<LiveVolume>> {
        let mut volumes = Vec::new();

        for entry in fs::read_dir(self.paths().live_dir())? {
            let entry = entry?;
            let Ok(handle) = entry.file_name().into_string() else {
                continue;
            };
            volumes.push(LiveVolume::new(self.clone(), handle, entry.path()));
        }

        Ok(volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NaiveDriver;

    fn filesystem(root: &std::path::Path) -> Filesystem {
        Filesystem::new(VolumePaths::with_root(root), Arc::new(NaiveDriver::new())).unwrap()
    }

    #[test]
    fn init_volumes_are_invisible_until_initialized() {
        let temp = tempfile::tempdir().unwrap();
        let fs = filesystem(temp.path());

        let init = fs.new_volume("a").unwrap();
        assert!(init.data_path().is_dir());
        assert!(fs.lookup_volume("a").unwrap().is_none());
        assert!(fs.list_volumes().unwrap().is_empty());

        let live = init.initialize().unwrap();
        assert_eq!(live.handle(), "a");
        assert!(fs.lookup_volume("a").unwrap().is_some());
        assert!(!fs.paths().init_volume("a").exists());
        assert_eq!(live.load_properties().unwrap(), Properties::new());
    }

    #[test]
    fn handle_exists_in_one_state_only() {
        let temp = tempfile::tempdir().unwrap();
        let fs = filesystem(temp.path());

        let pending = fs.new_volume("a").unwrap();
        assert!(matches!(
            fs.new_volume("a"),
            Err(ClaimError::VolumeAlreadyExists { .. })
        ));

        pending.initialize().unwrap();
        assert!(matches!(
            fs.new_volume("a"),
            Err(ClaimError::VolumeAlreadyExists { .. })
        ));
    }

    #[test]
    fn destroy_removes_everything() {
        let temp = tempfile::tempdir().unwrap();
        let fs = filesystem(temp.path());

        let live = fs.new_volume("a").unwrap().initialize().unwrap();
        std::fs::write(live.data_path().join("file"), b"x").unwrap();
        live.destroy().unwrap();

        assert!(fs.lookup_volume("a").unwrap().is_none());
        assert!(!fs.paths().dead_volume("a").exists());
        assert!(!fs.paths().live_volume("a").exists());
    }

    #[test]
    fn subvolumes_record_their_parent() {
        let temp = tempfile::tempdir().unwrap();
        let fs = filesystem(temp.path());

        let parent = fs.new_volume("parent").unwrap().initialize().unwrap();
        std::fs::write(parent.data_path().join("file"), b"from parent").unwrap();

        let child = parent.new_subvolume("child").unwrap().initialize().unwrap();
        assert_eq!(
            std::fs::read(child.data_path().join("file")).unwrap(),
            b"from parent"
        );
        assert_eq!(child.parent_handle().unwrap().as_deref(), Some("parent"));
        assert_eq!(child.parent().unwrap().unwrap().handle(), "parent");
        assert!(parent.parent().unwrap().is_none());
    }

    #[test]
    fn metadata_round_trips() {
        let temp = tempfile::tempdir().unwrap();
        let fs = filesystem(temp.path());
        let live = fs.new_volume("a").unwrap().initialize().unwrap();

        let props: Properties = [("k", "v")].into_iter().collect();
        live.store_properties(&props).unwrap();
        live.store_privileged(true).unwrap();

        assert_eq!(live.load_properties().unwrap(), props);
        assert!(live.load_privileged().unwrap());
    }

    #[test]
    fn missing_metadata_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let fs = filesystem(temp.path());
        let live = fs.new_volume("a").unwrap().initialize().unwrap();

        assert!(live.load_privileged().unwrap_err().is_volume_not_found());
    }

    #[test]
    fn invalid_handles_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let fs = filesystem(temp.path());

        assert!(matches!(
            fs.new_volume("../escape"),
            Err(ClaimError::InvalidHandle { .. })
        ));
        assert!(fs.lookup_volume("../escape").unwrap().is_none());
    }
}
