//! Recursive directory copy preserving modes, symlinks and (as root) owners.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use baggageclaim_common::{ClaimError, ClaimResult};
use walkdir::WalkDir;

/// Copy the contents of `src` into `dest`, creating `dest` if needed.
///
/// With `follow_symlinks` set, links are copied as what they point at;
/// otherwise they are recreated as links. Sockets, FIFOs and device nodes
/// are skipped.
///
/// # Errors
///
/// Returns an error if any entry cannot be read or written.
pub fn copy_tree(src: &Path, dest: &Path, follow_symlinks: bool) -> ClaimResult<()> {
    let preserve_owner = rustix::process::geteuid().is_root();
    let mut dirs = Vec::new();

    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(src).follow_links(follow_symlinks) {
        let entry = entry.map_err(walk_error)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ClaimError::Internal {
                message: e.to_string(),
            })?;
        let target = dest.join(relative);
        let meta = entry.metadata().map_err(walk_error)?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            dirs.push((target, meta));
            continue;
        }

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
            continue;
        }

        if preserve_owner {
            std::os::unix::fs::lchown(&target, Some(meta.uid()), Some(meta.gid()))?;
            if file_type.is_file() {
                // chown clears setuid bits
                fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode()))?;
            }
        }
    }

    // deepest first, so read-only directories do not block their own children
    for (dir, meta) in dirs.into_iter().rev() {
        if preserve_owner {
            std::os::unix::fs::lchown(&dir, Some(meta.uid()), Some(meta.gid()))?;
        }
        fs::set_permissions(&dir, fs::Permissions::from_mode(meta.mode()))?;
    }

    Ok(())
}

fn walk_error(err: walkdir::Error) -> ClaimError {
    let message = err.to_string();
    err.into_io_error().map_or_else(
        || ClaimError::Internal { message },
        ClaimError::Io,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_files_dirs_and_links() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("a/b/file"), b"content").unwrap();
        fs::set_permissions(
            src.path().join("a/b/file"),
            fs::Permissions::from_mode(0o750),
        )
        .unwrap();
        std::os::unix::fs::symlink("b/file", src.path().join("a/link")).unwrap();

        let dest = tempfile::tempdir().unwrap();
        copy_tree(src.path(), &dest.path().join("copy"), false).unwrap();

        let copied = dest.path().join("copy");
        assert_eq!(fs::read(copied.join("a/b/file")).unwrap(), b"content");
        assert_eq!(
            fs::metadata(copied.join("a/b/file")).unwrap().mode() & 0o777,
            0o750
        );
        assert_eq!(
            fs::read_link(copied.join("a/link")).unwrap(),
            Path::new("b/file")
        );
    }

    #[test]
    fn follows_links_when_asked() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("file"), b"content").unwrap();
        std::os::unix::fs::symlink("file", src.path().join("link")).unwrap();

        let dest = tempfile::tempdir().unwrap();
        copy_tree(src.path(), dest.path(), true).unwrap();

        let meta = fs::symlink_metadata(dest.path().join("link")).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(fs::read(dest.path().join("link")).unwrap(), b"content");
    }
}
