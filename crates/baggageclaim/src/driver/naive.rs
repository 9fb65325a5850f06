//! Plain-directory driver.

use std::fs;

use baggageclaim_common::ClaimResult;

use super::Driver;
use crate::copy::copy_tree;
use crate::filesystem::{Filesystem, FilesystemVolume, LiveVolume};

/// Stores volumes as ordinary directories. Copy-on-write is a full copy.
///
/// Works anywhere, needs no privileges, shares nothing between volumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveDriver;

impl NaiveDriver {
    /// Create the driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Driver for NaiveDriver {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn create_volume(&self, volume: &dyn FilesystemVolume) -> ClaimResult<()> {
        fs::create_dir(volume.data_path())?;
        Ok(())
    }

    fn destroy_volume(&self, _volume: &dyn FilesystemVolume) -> ClaimResult<()> {
        Ok(())
    }

    fn create_copy_on_write_layer(
        &self,
        child: &dyn FilesystemVolume,
        parent: &LiveVolume,
    ) -> ClaimResult<()> {
        copy_tree(&parent.data_path(), &child.data_path(), false)
    }

    fn recover(&self, _filesystem: &Filesystem) -> ClaimResult<()> {
        Ok(())
    }
}
