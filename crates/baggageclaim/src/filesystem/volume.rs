//! Volume directories in their three lifecycle states.
//!
//! Each state is its own type and transitions consume the value, so an
//! [`InitVolume`] cannot be used once it has become a [`LiveVolume`].

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use baggageclaim_common::paths::{PARENT_FILE, PRIVILEGED_FILE, PROPERTIES_FILE};
use baggageclaim_common::{ClaimError, ClaimResult, VolumePaths};

use super::Filesystem;
use crate::volume::Properties;

const RENAME_ATTEMPTS: u32 = 5;
const RENAME_BACKOFF: Duration = Duration::from_millis(100);

/// Metadata and data access shared by every volume state.
pub trait FilesystemVolume: Send + Sync {
    /// The volume handle.
    fn handle(&self) -> &str;

    /// The volume directory, holding data and metadata.
    fn dir(&self) -> &Path;

    /// Where the volume's data lives.
    fn data_path(&self) -> PathBuf {
        VolumePaths::data_path(self.dir())
    }

    /// Read `properties.json`.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeNotFound`] if the file is gone, or a
    /// decode error if it is unreadable.
    fn load_properties(&self) -> ClaimResult<Properties> {
        let raw = read_metadata(self.handle(), &self.dir().join(PROPERTIES_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Atomically replace `properties.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn store_properties(&self, properties: &Properties) -> ClaimResult<()> {
        write_atomically(self.dir(), PROPERTIES_FILE, &serde_json::to_vec(properties)?)
    }

    /// Read `privileged.json`.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeNotFound`] if the file is gone, or a
    /// decode error if it is unreadable.
    fn load_privileged(&self) -> ClaimResult<bool> {
        let raw = read_metadata(self.handle(), &self.dir().join(PRIVILEGED_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Atomically replace `privileged.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn store_privileged(&self, privileged: bool) -> ClaimResult<()> {
        write_atomically(self.dir(), PRIVILEGED_FILE, &serde_json::to_vec(&privileged)?)
    }

    /// Handle of the volume this one was layered on, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent file exists but cannot be read.
    fn parent_handle(&self) -> ClaimResult<Option<String>> {
        match fs::read_to_string(self.dir().join(PARENT_FILE)) {
            Ok(handle) => Ok(Some(handle.trim().to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn read_metadata(handle: &str, path: &Path) -> ClaimResult<Vec<u8>> {
    fs::read(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ClaimError::not_found(handle)
        } else {
            ClaimError::Io(err)
        }
    })
}

fn write_atomically(dir: &Path, name: &str, contents: &[u8]) -> ClaimResult<()> {
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(dir.join(name)).map_err(|e| ClaimError::Io(e.error))?;
    Ok(())
}

/// A volume being created. Invisible to lookups and listings.
#[derive(Debug)]
pub struct InitVolume {
    fs: Filesystem,
    handle: String,
    dir: PathBuf,
}

impl InitVolume {
    pub(super) const fn new(fs: Filesystem, handle: String, dir: PathBuf) -> Self {
        Self { fs, handle, dir }
    }

    /// Make the volume visible by moving it into the live directory.
    ///
    /// The rename is retried a few times on `EBUSY`, which mounts on the
    /// data directory can briefly cause.
    ///
    /// # Errors
    ///
    /// Returns the last rename error, after removing the volume.
    pub fn initialize(self) -> ClaimResult<LiveVolume> {
        let live = self.fs.paths().live_volume(&self.handle);

        let mut attempt = 1;
        loop {
            match fs::rename(&self.dir, &live) {
                Ok(()) => break,
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) && attempt < RENAME_ATTEMPTS => {
                    tracing::warn!(handle = %self.handle, attempt, "Volume busy, retrying initialize");
                    attempt += 1;
                    std::thread::sleep(RENAME_BACKOFF);
                }
                Err(err) => {
                    tracing::error!(handle = %self.handle, error = %err, "Failed to initialize volume");
                    if let Err(cleanup) = self.destroy() {
                        tracing::error!(error = %cleanup, "Failed to clean up volume");
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(LiveVolume::new(self.fs, self.handle, live))
    }

    /// Tear down a volume that never became live.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver or directory removal fails.
    pub fn destroy(self) -> ClaimResult<()> {
        let dead = self.fs.paths().dead_volume(&self.handle);
        fs::rename(&self.dir, &dead)?;
        DeadVolume::new(self.fs, self.handle, dead).destroy()
    }
}

impl FilesystemVolume for InitVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

/// A usable volume.
#[derive(Debug, Clone)]
pub struct LiveVolume {
    fs: Filesystem,
    handle: String,
    dir: PathBuf,
}

impl LiveVolume {
    pub(super) const fn new(fs: Filesystem, handle: String, dir: PathBuf) -> Self {
        Self { fs, handle, dir }
    }

    /// Create a copy-on-write child of this volume.
    ///
    /// The parent link is written only after the driver has built the
    /// child's layer. If the driver fails, the half-built child is destroyed.
    ///
    /// # Errors
    ///
    /// Returns the driver error, or an error creating the child directory.
    pub fn new_subvolume(&self, handle: &str) -> ClaimResult<InitVolume> {
        let child = self.fs.new_init_dir(handle)?;

        if let Err(err) = self
            .fs
            .driver()
            .create_copy_on_write_layer(&child, self)
        {
            if let Err(cleanup) = child.destroy() {
                tracing::error!(handle, error = %cleanup, "Failed to clean up child volume");
            }
            return Err(err);
        }

        if let Err(err) = fs::write(child.dir().join(PARENT_FILE), &self.handle) {
            if let Err(cleanup) = child.destroy() {
                tracing::error!(handle, error = %cleanup, "Failed to clean up child volume");
            }
            return Err(err.into());
        }

        Ok(child)
    }

    /// The live volume this one was layered on.
    ///
    /// Returns `None` for root volumes and for parents that are no longer
    /// live.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent link cannot be read.
    pub fn parent(&self) -> ClaimResult<Option<Self>> {
        match self.parent_handle()? {
            Some(handle) => self.fs.lookup_volume(&handle),
            None => Ok(None),
        }
    }

    /// Move the volume to the dead directory and release it.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename, driver or removal fails.
    pub fn destroy(self) -> ClaimResult<()> {
        let dead = self.fs.paths().dead_volume(&self.handle);
        fs::rename(&self.dir, &dead).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ClaimError::not_found(&self.handle)
            } else {
                ClaimError::Io(err)
            }
        })?;
        DeadVolume::new(self.fs, self.handle, dead).destroy()
    }
}

impl FilesystemVolume for LiveVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

/// A volume being torn down.
#[derive(Debug)]
pub struct DeadVolume {
    fs: Filesystem,
    handle: String,
    dir: PathBuf,
}

impl DeadVolume {
    const fn new(fs: Filesystem, handle: String, dir: PathBuf) -> Self {
        Self { fs, handle, dir }
    }

    /// Release the volume with the driver and remove its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails.
    pub fn destroy(self) -> ClaimResult<()> {
        self.fs.driver().destroy_volume(&self)?;
        fs::remove_dir_all(&self.dir)?;
        tracing::debug!(handle = %self.handle, "Removed volume directory");
        Ok(())
    }
}

impl FilesystemVolume for DeadVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}
