//! Standard filesystem paths for baggageclaim.
//!
//! A volume root holds one directory per lifecycle state:
//!
//! ```text
//! <root>/init/<handle>/{volume/, properties.json, privileged.json, parent}
//! <root>/live/<handle>/...
//! <root>/dead/<handle>/...
//! ```

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default root directory for volumes.
pub static VOLUMES_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("BAGGAGECLAIM_VOLUMES")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/baggageclaim/volumes"))
});

/// Name of the data directory inside a volume directory.
pub const DATA_DIR: &str = "volume";
/// Properties metadata file.
pub const PROPERTIES_FILE: &str = "properties.json";
/// Privileged flag metadata file.
pub const PRIVILEGED_FILE: &str = "privileged.json";
/// Parent back-reference file.
pub const PARENT_FILE: &str = "parent";

/// Layout of a volume root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumePaths {
    /// Root directory holding the state directories.
    pub root: PathBuf,
}

impl VolumePaths {
    /// Create paths with the default root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of volumes being created.
    #[must_use]
    pub fn init_dir(&self) -> PathBuf {
        self.root.join("init")
    }

    /// Directory of usable volumes.
    #[must_use]
    pub fn live_dir(&self) -> PathBuf {
        self.root.join("live")
    }

    /// Directory of volumes being torn down.
    #[must_use]
    pub fn dead_dir(&self) -> PathBuf {
        self.root.join("dead")
    }

    /// Init-state directory for a handle.
    #[must_use]
    pub fn init_volume(&self, handle: &str) -> PathBuf {
        self.init_dir().join(handle)
    }

    /// Live-state directory for a handle.
    #[must_use]
    pub fn live_volume(&self, handle: &str) -> PathBuf {
        self.live_dir().join(handle)
    }

    /// Dead-state directory for a handle.
    #[must_use]
    pub fn dead_volume(&self, handle: &str) -> PathBuf {
        self.dead_dir().join(handle)
    }

    /// Data directory of a volume directory.
    #[must_use]
    pub fn data_path(volume_dir: &Path) -> PathBuf {
        volume_dir.join(DATA_DIR)
    }

    /// Create the state directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.init_dir())?;
        std::fs::create_dir_all(self.live_dir())?;
        std::fs::create_dir_all(self.dead_dir())?;
        Ok(())
    }
}

impl Default for VolumePaths {
    fn default() -> Self {
        Self {
            root: VOLUMES_ROOT.clone(),
        }
    }
}

/// Layout of the overlay driver's layer storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPaths {
    /// Directory holding one upper layer per volume.
    pub root: PathBuf,
}

impl OverlayPaths {
    /// Create overlay paths under a root.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Upper layer of a volume.
    #[must_use]
    pub fn layer(&self, handle: &str) -> PathBuf {
        self.root.join(handle)
    }

    /// Overlay work directory of a volume.
    #[must_use]
    pub fn work(&self, handle: &str) -> PathBuf {
        self.root.join("work").join(handle)
    }
}
