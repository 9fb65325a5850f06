//! Mount operations.

use std::path::Path;

use baggageclaim_common::ClaimResult;

/// Overlay mount data for a single lower layer.
#[must_use]
pub fn overlay_options(lower: &Path, upper: &Path, work: &Path) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    )
}

/// Mount an overlay of `upper` on `lower` at `target`.
#[cfg(target_os = "linux")]
pub fn mount_overlay(lower: &Path, upper: &Path, work: &Path, target: &Path) -> ClaimResult<()> {
    use rustix::mount::{MountFlags, mount};
    use std::ffi::CString;

    let options = overlay_options(lower, upper, work);
    tracing::debug!(target = %target.display(), options = %options, "Mounting overlayfs");

    let fstype = c"overlay";
    let data = CString::new(options).map_err(|_| baggageclaim_common::ClaimError::Config {
        message: "Invalid overlay options (contains null byte)".to_string(),
    })?;

    mount("overlay", target, fstype, MountFlags::empty(), data.as_c_str())
        .map_err(|e| baggageclaim_common::ClaimError::Io(e.into()))?;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(
    _lower: &Path,
    _upper: &Path,
    _work: &Path,
    _target: &Path,
) -> ClaimResult<()> {
    Err(baggageclaim_common::ClaimError::Unsupported {
        feature: "overlayfs".to_string(),
    })
}

/// Bind mount `source` onto `target`.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path) -> ClaimResult<()> {
    use rustix::mount::mount_bind;

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "Creating bind mount"
    );

    mount_bind(source, target).map_err(|e| baggageclaim_common::ClaimError::Io(e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path) -> ClaimResult<()> {
    Err(baggageclaim_common::ClaimError::Unsupported {
        feature: "bind mounts".to_string(),
    })
}

/// Unmount `target`. A target that is not mounted, or no longer exists,
/// is not an error.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> ClaimResult<()> {
    use rustix::io::Errno;
    use rustix::mount::{UnmountFlags, unmount};

    tracing::debug!(target = %target.display(), "Unmounting filesystem");

    match unmount(target, UnmountFlags::empty()) {
        Ok(()) | Err(Errno::INVAL | Errno::NOENT) => Ok(()),
        Err(e) => Err(baggageclaim_common::ClaimError::Io(e.into())),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> ClaimResult<()> {
    Err(baggageclaim_common::ClaimError::Unsupported {
        feature: "unmount".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_mount_options() {
        let options = overlay_options(
            Path::new("/overlays/root"),
            Path::new("/overlays/child"),
            Path::new("/overlays/work/child"),
        );
        insta::assert_snapshot!(
            options,
            @"lowerdir=/overlays/root,upperdir=/overlays/child,workdir=/overlays/work/child"
        );
    }
}
