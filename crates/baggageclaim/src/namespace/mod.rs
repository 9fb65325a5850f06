//! Ownership remapping across the privilege boundary.
//!
//! Volumes written by privileged containers are owned by host root; the same
//! data seen by an unprivileged container must be owned by the ID its root is
//! mapped to. A [`Namespacer`] rewrites ownership of a tree to match, and wraps
//! subprocesses so whatever they create lands with the right owner.

mod mapper;

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::process::Command;

use baggageclaim_common::{ClaimError, ClaimResult};
use walkdir::WalkDir;

pub use mapper::{IdMap, Mapper, MapperKind, max_valid_id};

const SETID_BITS: u32 = 0o6000;

/// Remaps file ownership for one side of the privilege boundary.
pub trait Namespacer: Send + Sync + fmt::Debug {
    /// Rewrite ownership of every entry under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be walked or an entry cannot be
    /// chowned.
    fn namespace_path(&self, path: &Path) -> ClaimResult<()>;

    /// A command for `program` that runs in the matching ID-mapped context.
    fn namespace_command(&self, program: &OsStr) -> Command;

    /// The ID a container on this side of the boundary sees for host `id`.
    ///
    /// Archives carry these IDs so they unpack with the same ownership
    /// wherever they land.
    fn container_id(&self, id: u32) -> u32 {
        id
    }
}

/// Namespacer driven by a [`Mapper`].
#[derive(Debug, Clone, Copy)]
pub struct UidNamespacer {
    mapper: Mapper,
}

impl UidNamespacer {
    /// Create a namespacer for a mapper.
    #[must_use]
    pub const fn new(mapper: Mapper) -> Self {
        Self { mapper }
    }

    /// The mapper in use.
    #[must_use]
    pub const fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    fn translate(&self, path: &Path, meta: &fs::Metadata) -> ClaimResult<()> {
        let uid = self.mapper.map(meta.uid());
        let gid = self.mapper.map(meta.gid());
        if uid == meta.uid() && gid == meta.gid() {
            return Ok(());
        }

        std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;

        // chown drops setuid/setgid on regular files
        let mode = meta.mode();
        if !meta.file_type().is_symlink() && mode & SETID_BITS != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
        }

        Ok(())
    }
}

impl Namespacer for UidNamespacer {
    fn namespace_path(&self, path: &Path) -> ClaimResult<()> {
        tracing::debug!(path = %path.display(), kind = ?self.mapper.kind(), "Namespacing path");

        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| match e.into_io_error() {
                Some(err) => ClaimError::Io(err),
                None => ClaimError::Internal {
                    message: "filesystem loop while namespacing".to_string(),
                },
            })?;
            let meta = entry.metadata().map_err(|e| ClaimError::Internal {
                message: e.to_string(),
            })?;
            self.translate(entry.path(), &meta)?;
        }

        Ok(())
    }

    fn namespace_command(&self, program: &OsStr) -> Command {
        let maps = self.mapper.id_maps();
        if maps.is_empty() {
            return Command::new(program);
        }

        let mut cmd = Command::new("unshare");
        cmd.arg("--user");
        for map in &maps {
            let arg = map.to_unshare_format();
            cmd.arg(format!("--map-users={arg}"));
            cmd.arg(format!("--map-groups={arg}"));
        }
        cmd.args(["--setuid", "0", "--setgid", "0", "--"]);
        cmd.arg(program);
        cmd
    }

    fn container_id(&self, id: u32) -> u32 {
        match self.mapper.kind() {
            MapperKind::Unprivileged => Mapper::privileged(self.mapper.max_id()).map(id),
            MapperKind::Privileged => id,
        }
    }
}

/// Namespacer that leaves ownership untouched.
///
/// Used when user namespaces are disabled or the daemon is not root.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNamespacer;

impl Namespacer for NoopNamespacer {
    fn namespace_path(&self, _path: &Path) -> ClaimResult<()> {
        Ok(())
    }

    fn namespace_command(&self, program: &OsStr) -> Command {
        Command::new(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_path_applies_mapper() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("dir")).unwrap();
        std::fs::write(temp.path().join("dir/file"), b"data").unwrap();
        std::os::unix::fs::symlink("file", temp.path().join("dir/link")).unwrap();

        let owner = std::fs::metadata(temp.path()).unwrap().uid();
        let mapper = Mapper::unprivileged(65534);
        UidNamespacer::new(mapper)
            .namespace_path(temp.path())
            .unwrap();

        for path in ["dir", "dir/file", "dir/link"] {
            let meta = std::fs::symlink_metadata(temp.path().join(path)).unwrap();
            assert_eq!(meta.uid(), mapper.map(owner), "{path}");
        }
    }

    #[test]
    fn unprivileged_command_is_wrapped() {
        let cmd = UidNamespacer::new(Mapper::unprivileged(65535)).namespace_command("tar".as_ref());
        assert_eq!(cmd.get_program(), "unshare");

        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args.first().map(String::as_str), Some("--user"));
        assert!(args.contains(&"--map-users=65535,0,1".to_string()));
        assert!(args.contains(&"--map-groups=1,1,65534".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("tar"));
    }

    #[test]
    fn privileged_and_noop_commands_run_directly() {
        let cmd = UidNamespacer::new(Mapper::privileged(65535)).namespace_command("tar".as_ref());
        assert_eq!(cmd.get_program(), "tar");
        assert_eq!(cmd.get_args().count(), 0);

        assert_eq!(NoopNamespacer.namespace_command("tar".as_ref()).get_program(), "tar");
    }

    #[test]
    fn container_ids_undo_the_unprivileged_window() {
        let unprivileged = UidNamespacer::new(Mapper::unprivileged(65534));
        assert_eq!(unprivileged.container_id(65534), 0);
        assert_eq!(unprivileged.container_id(1000), 1000);

        let privileged = UidNamespacer::new(Mapper::privileged(65534));
        assert_eq!(privileged.container_id(65534), 65534);
        assert_eq!(privileged.container_id(0), 0);
        assert_eq!(NoopNamespacer.container_id(65534), 65534);
    }
}
