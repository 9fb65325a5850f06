//! Tar-based archive transfer in and out of volumes.
//!
//! Every [`Streamer`] moves a tar archive through one [`Encoding`]. Archives
//! are written either in-process with the `tar` crate or by an external `tar`
//! binary launched through the volume's [`Namespacer`] and bound to a
//! pre-opened directory, so it never needs to traverse the volume root.

mod encoding;
mod limit;
mod p2p;
mod pipe;

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;

use baggageclaim_common::{ClaimError, ClaimResult};
use walkdir::WalkDir;

use crate::namespace::Namespacer;

pub use encoding::{Encoding, sniff};
pub use limit::LimitedReader;
pub use p2p::stream_to_peer;
pub use pipe::{PipeReader, PipeWriter, pipe};

/// Moves tar archives into and out of a directory.
pub trait Streamer: Send + Sync + fmt::Debug {
    /// The encoding this streamer reads and writes.
    fn encoding(&self) -> Encoding;

    /// Extract an archive from `reader` into `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::BadStream`] when the input is malformed, or an
    /// infrastructure error otherwise.
    fn stream_in(&self, reader: &mut dyn Read, dest: &Path, privileged: bool) -> ClaimResult<()>;

    /// Write an archive of `src` into `writer`.
    ///
    /// # Errors
    ///
    /// Returns an error if `src` cannot be read or `writer` fails.
    fn stream_out(&self, writer: &mut dyn Write, src: &Path, privileged: bool) -> ClaimResult<()>;
}

/// How archives are produced and consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Archiver {
    /// The `tar` crate, in this process.
    #[default]
    InProcess,
    /// An external `tar` binary.
    External {
        /// Path to the binary.
        tar_bin: PathBuf,
    },
}

/// [`Streamer`] for a single encoding.
#[derive(Debug, Clone)]
pub struct TarStreamer {
    encoding: Encoding,
    archiver: Archiver,
    privileged: Arc<dyn Namespacer>,
    unprivileged: Arc<dyn Namespacer>,
}

impl TarStreamer {
    /// Create a streamer.
    #[must_use]
    pub fn new(
        encoding: Encoding,
        archiver: Archiver,
        privileged: Arc<dyn Namespacer>,
        unprivileged: Arc<dyn Namespacer>,
    ) -> Self {
        Self {
            encoding,
            archiver,
            privileged,
            unprivileged,
        }
    }

    fn namespacer(&self, privileged: bool) -> &dyn Namespacer {
        if privileged {
            self.privileged.as_ref()
        } else {
            self.unprivileged.as_ref()
        }
    }

    fn extract_in_process(
        &self,
        reader: &mut dyn Read,
        dest: &Path,
        privileged: bool,
    ) -> ClaimResult<()> {
        let decoder = self.encoding.decoder(reader).map_err(bad_stream_or_io)?;
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        archive.set_preserve_ownerships(running_as_root());
        archive.set_overwrite(true);
        archive.unpack(dest).map_err(bad_stream_or_io)?;

        if !privileged {
            self.namespacer(false).namespace_path(dest)?;
        }
        Ok(())
    }

    fn extract_external(
        &self,
        tar_bin: &Path,
        reader: &mut dyn Read,
        dest: &Path,
        privileged: bool,
    ) -> ClaimResult<()> {
        let mut decoder = self.encoding.decoder(reader).map_err(bad_stream_or_io)?;

        let mut cmd = self
            .namespacer(privileged)
            .namespace_command(tar_bin.as_os_str());
        cmd.args(["-x", "-f", "-"]);
        bind_to_directory(&mut cmd, File::open(dest)?);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        tracing::debug!(dest = %dest.display(), encoding = %self.encoding, "Spawning tar -x");
        let mut child = cmd.spawn()?;

        let (copied, status, stderr) =
            wait_draining_stderr(&mut child, |child| match child.stdin.take() {
                Some(mut stdin) => copy_classified(&mut decoder, &mut stdin),
                None => Ok(()),
            })?;

        // a decode failure is the caller's fault regardless of what tar did
        if let Err(CopyError::Read(err)) = copied {
            return Err(bad_stream_or_io(err));
        }
        if !status.success() {
            return Err(ClaimError::BadStream { message: stderr });
        }
        if let Err(CopyError::Write(err)) = copied {
            return Err(ClaimError::Io(err));
        }
        Ok(())
    }

    fn archive_external(
        &self,
        tar_bin: &Path,
        writer: &mut dyn Write,
        src: &Path,
        privileged: bool,
    ) -> ClaimResult<()> {
        let (dir, member): (&Path, OsString) = if src.is_dir() {
            (src, OsString::from("."))
        } else {
            let parent = src.parent().unwrap_or_else(|| Path::new("/"));
            let name = src.file_name().map(ToOwned::to_owned).ok_or_else(|| {
                ClaimError::SourcePathNotFound {
                    path: src.display().to_string(),
                }
            })?;
            (parent, name)
        };

        let mut cmd = self
            .namespacer(privileged)
            .namespace_command(tar_bin.as_os_str());
        cmd.args(["-c", "-f", "-"]).arg(member);
        bind_to_directory(&mut cmd, File::open(dir)?);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(src = %src.display(), encoding = %self.encoding, "Spawning tar -c");
        let mut child = cmd.spawn()?;

        let encoding = self.encoding;
        let (copied, status, stderr) =
            wait_draining_stderr(&mut child, |child| match child.stdout.take() {
                Some(mut stdout) => encoding.encode(writer, |w| io::copy(&mut stdout, w).map(drop)),
                None => Ok(()),
            })?;

        // a failed writer kills tar with SIGPIPE, so its own error comes first
        copied?;
        if !status.success() {
            return Err(ClaimError::Command {
                command: format!("{} -c", tar_bin.display()),
                status: status.to_string(),
                stderr,
            });
        }
        Ok(())
    }
}

impl Streamer for TarStreamer {
    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn stream_in(&self, reader: &mut dyn Read, dest: &Path, privileged: bool) -> ClaimResult<()> {
        match &self.archiver {
            Archiver::InProcess => self.extract_in_process(reader, dest, privileged),
            Archiver::External { tar_bin } => {
                self.extract_external(tar_bin, reader, dest, privileged)
            }
        }
    }

    fn stream_out(&self, writer: &mut dyn Write, src: &Path, privileged: bool) -> ClaimResult<()> {
        match &self.archiver {
            Archiver::InProcess => {
                let namespacer = self.namespacer(privileged);
                self.encoding.encode(writer, |w| {
                    write_archive(w, src, &|id| namespacer.container_id(id))
                })?;
                Ok(())
            }
            Archiver::External { tar_bin } => {
                self.archive_external(tar_bin, writer, src, privileged)
            }
        }
    }
}

/// One [`Streamer`] per [`Encoding`].
#[derive(Debug, Clone)]
pub struct Streamers {
    gzip: Arc<dyn Streamer>,
    zstd: Arc<dyn Streamer>,
    s2: Arc<dyn Streamer>,
    raw: Arc<dyn Streamer>,
}

impl Streamers {
    /// Build tar streamers for every encoding.
    #[must_use]
    pub fn new(
        archiver: &Archiver,
        privileged: &Arc<dyn Namespacer>,
        unprivileged: &Arc<dyn Namespacer>,
    ) -> Self {
        let build = |encoding| -> Arc<dyn Streamer> {
            Arc::new(TarStreamer::new(
                encoding,
                archiver.clone(),
                Arc::clone(privileged),
                Arc::clone(unprivileged),
            ))
        };

        Self {
            gzip: build(Encoding::Gzip),
            zstd: build(Encoding::Zstd),
            s2: build(Encoding::S2),
            raw: build(Encoding::Raw),
        }
    }

    /// The streamer for `encoding`.
    #[must_use]
    pub fn get(&self, encoding: Encoding) -> &dyn Streamer {
        match encoding {
            Encoding::Gzip => self.gzip.as_ref(),
            Encoding::Zstd => self.zstd.as_ref(),
            Encoding::S2 => self.s2.as_ref(),
            Encoding::Raw => self.raw.as_ref(),
        }
    }
}

/// Archive `src`, recording every owner as `owner` translates it.
fn write_archive(writer: &mut dyn Write, src: &Path, owner: &dyn Fn(u32) -> u32) -> io::Result<()> {
    let mut builder = tar::Builder::new(writer);

    if src.is_dir() {
        for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            let name = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            append_entry(&mut builder, entry.path(), name, owner)?;
        }
    } else {
        let name = src
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        append_entry(&mut builder, src, Path::new(name), owner)?;
    }

    builder.finish()
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &Path,
    owner: &dyn Fn(u32) -> u32,
) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let file_type = meta.file_type();
    if file_type.is_socket() {
        tracing::debug!(path = %path.display(), "Skipping socket");
        return Ok(());
    }

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);
    header.set_uid(u64::from(owner(meta.uid())));
    header.set_gid(u64::from(owner(meta.gid())));

    if file_type.is_symlink() {
        builder.append_link(&mut header, name, fs::read_link(path)?)
    } else if file_type.is_file() {
        let file = File::open(path)?;
        builder.append_data(&mut header, name, file.take(meta.len()))
    } else {
        if file_type.is_char_device() || file_type.is_block_device() {
            header.set_device_major(rustix::fs::major(meta.rdev()))?;
            header.set_device_minor(rustix::fs::minor(meta.rdev()))?;
        }
        builder.append_data(&mut header, name, io::empty())
    }
}

/// Run `body` against a spawned child while its stderr is collected on a
/// separate thread, then reap it.
///
/// Returns what `body` produced, the exit status and the trimmed stderr.
fn wait_draining_stderr<T>(
    child: &mut Child,
    body: impl FnOnce(&mut Child) -> T,
) -> io::Result<(T, ExitStatus, String)> {
    let stderr = child.stderr.take();
    std::thread::scope(|scope| {
        let drained = scope.spawn(move || -> io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                stderr.read_to_end(&mut buf)?;
            }
            Ok(buf)
        });

        let value = body(child);
        let status = child.wait()?;
        let stderr = drained
            .join()
            .map_err(|_| io::Error::other("stderr reader panicked"))??;

        Ok((value, status, String::from_utf8_lossy(&stderr).trim().to_string()))
    })
}

/// Start the child with its working directory set to an already-open `dir`.
#[allow(unsafe_code)]
fn bind_to_directory(cmd: &mut Command, dir: File) {
    use std::os::unix::process::CommandExt;

    // SAFETY: fchdir is async-signal-safe and touches no memory shared with
    // the parent.
    unsafe {
        cmd.pre_exec(move || rustix::process::fchdir(&dir).map_err(io::Error::from));
    }
}

enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

fn copy_classified(reader: &mut dyn Read, writer: &mut dyn Write) -> Result<(), CopyError> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return writer.flush().map_err(CopyError::Write),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(CopyError::Read(err)),
        };
        writer.write_all(&buf[..n]).map_err(CopyError::Write)?;
    }
}

/// Map an archive read failure onto the client/infrastructure split.
#[must_use]
pub fn bad_stream_or_io(err: io::Error) -> ClaimError {
    match err.kind() {
        io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Other => ClaimError::BadStream {
            message: err.to_string(),
        },
        _ => ClaimError::Io(err),
    }
}

/// Reduce a caller-supplied sub-path to plain components, so it cannot
/// escape the directory it is joined onto.
#[must_use]
pub fn sanitize_path(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn running_as_root() -> bool {
    rustix::process::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NoopNamespacer;
    use proptest::prelude::*;

    fn streamer(encoding: Encoding) -> TarStreamer {
        TarStreamer::new(
            encoding,
            Archiver::InProcess,
            Arc::new(NoopNamespacer),
            Arc::new(NoopNamespacer),
        )
    }

    #[test]
    fn single_file_round_trip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("file.txt"), b"hello").unwrap();

        let mut archive = Vec::new();
        streamer(Encoding::Zstd)
            .stream_out(&mut archive, &src.path().join("file.txt"), false)
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        streamer(Encoding::Zstd)
            .stream_in(&mut &archive[..], dest.path(), false)
            .unwrap();

        assert_eq!(std::fs::read(dest.path().join("file.txt")).unwrap(), b"hello");
    }

    #[test]
    fn garbage_is_a_bad_stream() {
        let dest = tempfile::tempdir().unwrap();
        let err = streamer(Encoding::Gzip)
            .stream_in(&mut &b"definitely not gzip"[..], dest.path(), false)
            .unwrap_err();
        assert!(matches!(err, ClaimError::BadStream { .. }), "{err:?}");
    }

    #[test]
    fn truncated_archive_is_a_bad_stream() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("big"), vec![1u8; 8192]).unwrap();

        let mut archive = Vec::new();
        streamer(Encoding::Raw)
            .stream_out(&mut archive, src.path(), false)
            .unwrap();
        // cut inside the first header block
        archive.truncate(100);

        let dest = tempfile::tempdir().unwrap();
        let err = streamer(Encoding::Raw)
            .stream_in(&mut &archive[..], dest.path(), false)
            .unwrap_err();
        assert!(matches!(err, ClaimError::BadStream { .. }), "{err:?}");
    }

    #[test]
    fn in_process_archives_record_container_owners() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("f"), b"data").unwrap();
        std::os::unix::fs::symlink("f", src.path().join("link")).unwrap();
        let owner = std::fs::symlink_metadata(src.path().join("f")).unwrap().uid();

        let mut archive = Vec::new();
        write_archive(&mut archive, src.path(), &|id| if id == owner { 4242 } else { id }).unwrap();

        let mut names = Vec::new();
        for entry in tar::Archive::new(&archive[..]).entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().uid().unwrap(), 4242);
            names.push(entry.path().unwrap().into_owned());
        }
        names.sort();
        assert_eq!(names, [PathBuf::from("f"), PathBuf::from("link")]);
    }

    #[test]
    fn sockets_are_left_out_of_archives() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("f"), b"data").unwrap();
        let _socket = std::os::unix::net::UnixListener::bind(src.path().join("sock")).unwrap();

        let mut archive = Vec::new();
        streamer(Encoding::Raw)
            .stream_out(&mut archive, src.path(), false)
            .unwrap();

        let entries = tar::Archive::new(&archive[..]).entries().unwrap().count();
        assert_eq!(entries, 1);
    }

    /// A `tar` wrapper that floods stderr well past a pipe buffer first.
    fn noisy_tar(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("noisy-tar");
        std::fs::write(
            &script,
            "#!/bin/sh\nyes 'tar: file changed as we read it' | head -n 20000 >&2\nexec tar \"$@\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    /// Run `f` on its own thread, failing instead of hanging the suite.
    fn within_a_minute<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || tx.send(f()));
        rx.recv_timeout(std::time::Duration::from_secs(60))
            .expect("external tar stalled")
    }

    #[test]
    fn chatty_external_tar_does_not_stall() {
        let bin = tempfile::tempdir().unwrap();
        let tar = TarStreamer::new(
            Encoding::Gzip,
            Archiver::External {
                tar_bin: noisy_tar(bin.path()),
            },
            Arc::new(NoopNamespacer),
            Arc::new(NoopNamespacer),
        );

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("file"), b"contents").unwrap();
        let dest = tempfile::tempdir().unwrap();

        let out = tar.clone();
        let src_path = src.path().to_path_buf();
        let archive = within_a_minute(move || {
            let mut archive = Vec::new();
            out.stream_out(&mut archive, &src_path, true).map(|()| archive)
        })
        .unwrap();

        let dest_path = dest.path().to_path_buf();
        within_a_minute(move || tar.stream_in(&mut &archive[..], &dest_path, true)).unwrap();

        assert_eq!(std::fs::read(dest.path().join("file")).unwrap(), b"contents");
    }

    #[test]
    fn sanitize_strips_escapes() {
        assert_eq!(sanitize_path("../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(sanitize_path("/abs/./dir"), PathBuf::from("abs/dir"));
        assert_eq!(sanitize_path("."), PathBuf::new());
        assert_eq!(sanitize_path(""), PathBuf::new());
    }

    proptest! {
        #[test]
        fn sanitized_paths_stay_inside(parts in prop::collection::vec(
            prop_oneof![Just("..".to_string()), Just(".".to_string()), "[a-z]{1,8}"],
            0..8,
        )) {
            let joined = parts.join("/");
            let sanitized = sanitize_path(&joined);
            prop_assert!(sanitized.is_relative());
            prop_assert!(sanitized
                .components()
                .all(|c| matches!(c, Component::Normal(_))));
        }
    }
}
