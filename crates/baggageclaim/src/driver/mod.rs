//! Physical volume storage.
//!
//! A [`Driver`] owns whatever backs a volume's data directory:
//! - [`NaiveDriver`]: plain directories, copy-on-write by full copy
//! - [`OverlayDriver`]: bind mounts and overlayfs (Linux)
//! - [`BtrfsDriver`]: btrfs subvolumes and snapshots

mod btrfs;
mod mounts;
mod naive;
mod overlay;

use std::fmt;
use std::process::Command;

use baggageclaim_common::{ClaimError, ClaimResult};

use crate::filesystem::{Filesystem, FilesystemVolume, LiveVolume};

pub use btrfs::{BtrfsDriver, deletion_order};
pub use mounts::{bind_mount, mount_overlay, overlay_options, unmount};
pub use naive::NaiveDriver;
pub use overlay::OverlayDriver;

/// Storage backend for volume data.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Short name, for logs.
    fn name(&self) -> &'static str;

    /// Provide an empty data directory for a new volume.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be set up.
    fn create_volume(&self, volume: &dyn FilesystemVolume) -> ClaimResult<()>;

    /// Release whatever backs a volume's data directory.
    ///
    /// The directory itself is removed by the caller afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be released.
    fn destroy_volume(&self, volume: &dyn FilesystemVolume) -> ClaimResult<()>;

    /// Give `child` a data directory that starts as a copy of `parent`'s.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be built.
    fn create_copy_on_write_layer(
        &self,
        child: &dyn FilesystemVolume,
        parent: &LiveVolume,
    ) -> ClaimResult<()>;

    /// Re-establish state lost across a restart, such as mounts.
    ///
    /// # Errors
    ///
    /// Returns an error if any volume cannot be restored.
    fn recover(&self, filesystem: &Filesystem) -> ClaimResult<()>;
}

/// Run a command to completion, turning a non-zero exit into
/// [`ClaimError::Command`].
pub(crate) fn run(cmd: &mut Command) -> ClaimResult<()> {
    let rendered = format!("{cmd:?}");
    tracing::debug!(command = %rendered, "Running command");

    let output = cmd.output()?;
    if output.status.success() {
        return Ok(());
    }

    Err(ClaimError::Command {
        command: rendered,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_command_reports_stderr() {
        let err = run(Command::new("sh").args(["-c", "echo boom >&2; exit 3"])).unwrap_err();
        match err {
            ClaimError::Command { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
