//! The volume repository.
//!
//! Every boundary operation goes through [`VolumeRepository`]. It ties the
//! filesystem, strategies, namespacers and streamers together and takes the
//! per-handle lock around anything that mutates a volume's metadata.
//!
//! All methods block; async callers should run them on a blocking thread.

use std::fs;
use std::io::{self, Read, Write};
use std::sync::Arc;

use baggageclaim_common::{ClaimError, ClaimResult};

use crate::filesystem::{Filesystem, FilesystemVolume, LiveVolume};
use crate::lock::LockManager;
use crate::namespace::Namespacer;
use crate::promise::Promise;
use crate::strategy::Strategy;
use crate::stream::{Archiver, Encoding, LimitedReader, Streamers, sanitize_path, stream_to_peer};
use crate::volume::{Properties, Volume};

/// Orchestrates volume creation, metadata, streaming and destruction.
#[derive(Debug)]
pub struct VolumeRepository {
    filesystem: Filesystem,
    locks: LockManager,
    privileged: Arc<dyn Namespacer>,
    unprivileged: Arc<dyn Namespacer>,
    streamers: Streamers,
}

impl VolumeRepository {
    /// Create a repository over `filesystem`.
    #[must_use]
    pub fn new(
        filesystem: Filesystem,
        privileged: Arc<dyn Namespacer>,
        unprivileged: Arc<dyn Namespacer>,
        archiver: &Archiver,
    ) -> Self {
        let streamers = Streamers::new(archiver, &privileged, &unprivileged);
        Self {
            filesystem,
            locks: LockManager::new(),
            privileged,
            unprivileged,
            streamers,
        }
    }

    /// The underlying filesystem.
    #[must_use]
    pub const fn filesystem(&self) -> &Filesystem {
        &self.filesystem
    }

    fn namespacer(&self, privileged: bool) -> &dyn Namespacer {
        if privileged {
            self.privileged.as_ref()
        } else {
            self.unprivileged.as_ref()
        }
    }

    fn live_volume(&self, handle: &str) -> ClaimResult<LiveVolume> {
        match self.filesystem.lookup_volume(handle) {
            Ok(Some(volume)) => Ok(volume),
            Ok(None) => {
                tracing::info!(handle, "Volume not found");
                Err(ClaimError::not_found(handle))
            }
            Err(err) => {
                tracing::error!(handle, error = %err, "Failed to look up volume");
                Err(err)
            }
        }
    }

    /// Snapshot every live volume matching `query`.
    ///
    /// Volumes destroyed mid-scan are skipped. Volumes whose metadata cannot
    /// be read are returned as corrupted handles instead.
    ///
    /// # Errors
    ///
    /// Returns an error only if the live directory cannot be listed.
    pub fn list_volumes(&self, query: &Properties) -> ClaimResult<(Vec<Volume>, Vec<String>)> {
        let mut healthy = Vec::new();
        let mut corrupted = Vec::new();

        for live in self.filesystem.list_volumes()? {
            match volume_from(&live) {
                Ok(volume) => {
                    if volume.properties.has_properties(query) {
                        healthy.push(volume);
                    }
                }
                Err(err) if err.is_volume_not_found() => {}
                Err(err) => {
                    tracing::warn!(handle = live.handle(), error = %err, "Failed to hydrate volume");
                    corrupted.push(live.handle().to_string());
                }
            }
        }

        Ok((healthy, corrupted))
    }

    /// Look up one live volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume exists but its metadata is unreadable.
    pub fn get_volume(&self, handle: &str) -> ClaimResult<Option<Volume>> {
        let Some(live) = self.filesystem.lookup_volume(handle)? else {
            tracing::debug!(handle, "Volume not found");
            return Ok(None);
        };

        match volume_from(&live) {
            Ok(volume) => Ok(Some(volume)),
            Err(err) if err.is_volume_not_found() => Ok(None),
            Err(err) => {
                tracing::error!(handle, error = %err, "Failed to hydrate volume");
                Err(err)
            }
        }
    }

    /// Create a volume and make it live.
    ///
    /// Anything that fails before the volume goes live removes it again. Once
    /// it is live it is kept.
    ///
    /// # Errors
    ///
    /// Returns the strategy, metadata, namespacing or initialize error.
    pub fn create_volume(
        &self,
        handle: &str,
        strategy: &Strategy,
        properties: Properties,
        privileged: bool,
    ) -> ClaimResult<Volume> {
        let _guard = self.locks.lock(handle);

        let init = strategy
            .materialize(handle, &self.filesystem, &self.streamers)
            .inspect_err(|err| {
                tracing::error!(handle, error = %err, "Failed to materialize strategy");
            })?;

        let prepared = init
            .store_properties(&properties)
            .and_then(|()| init.store_privileged(privileged))
            .and_then(|()| self.namespacer(privileged).namespace_path(&init.data_path()));

        if let Err(err) = prepared {
            tracing::error!(handle, error = %err, "Failed to prepare volume");
            if let Err(cleanup) = init.destroy() {
                tracing::error!(handle, error = %cleanup, "Failed to clean up volume");
            }
            return Err(err);
        }

        let live = init.initialize()?;

        tracing::info!(handle, privileged, "Created volume");
        Ok(Volume {
            handle: live.handle().to_string(),
            path: live.data_path(),
            properties,
            privileged,
        })
    }

    /// Run [`Self::create_volume`] and settle `promise` with the outcome.
    ///
    /// If the promise was canceled while the volume was being built, the
    /// volume is destroyed instead of kept.
    pub fn create_volume_for_promise(
        &self,
        promise: &Promise,
        handle: &str,
        strategy: &Strategy,
        properties: Properties,
        privileged: bool,
    ) {
        match self.create_volume(handle, strategy, properties, privileged) {
            Ok(volume) => match promise.fulfill(volume) {
                Ok(()) => {}
                Err(ClaimError::PromiseCanceled) => {
                    tracing::info!(handle, "Creation canceled, destroying volume");
                    if let Err(err) = self.destroy_volume(handle) {
                        tracing::error!(handle, error = %err, "Failed to destroy canceled volume");
                    }
                }
                Err(err) => {
                    tracing::error!(handle, error = %err, "Failed to fulfil promise");
                }
            },
            Err(err) => {
                if let Err(settle) = promise.reject(err) {
                    tracing::error!(handle, error = %settle, "Failed to reject promise");
                }
            }
        }
    }

    /// Destroy one volume.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeNotFound`] if the handle is not live.
    pub fn destroy_volume(&self, handle: &str) -> ClaimResult<()> {
        let _guard = self.locks.lock(handle);

        let live = self.live_volume(handle)?;
        live.destroy().inspect_err(|err| {
            tracing::error!(handle, error = %err, "Failed to destroy volume");
        })?;

        tracing::info!(handle, "Destroyed volume");
        Ok(())
    }

    /// Destroy a volume after every volume layered on it, directly or
    /// transitively.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeNotFound`] if the handle is not live, or
    /// the first destroy error.
    pub fn destroy_volume_and_descendants(&self, handle: &str) -> ClaimResult<()> {
        let volumes = self.filesystem.list_volumes()?;

        if !volumes.iter().any(|v| v.handle() == handle) {
            return Err(ClaimError::not_found(handle));
        }

        for candidate in &volumes {
            let Ok(Some(parent)) = candidate.parent_handle() else {
                continue;
            };
            if parent == handle {
                self.destroy_volume_and_descendants(candidate.handle())?;
            }
        }

        self.destroy_volume(handle)
    }

    /// Set one property on a volume.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeNotFound`] if the handle is not live.
    pub fn set_property(&self, handle: &str, name: &str, value: &str) -> ClaimResult<()> {
        let _guard = self.locks.lock(handle);

        let live = self.live_volume(handle)?;
        let properties = live.load_properties()?.update_property(name, value);
        live.store_properties(&properties).inspect_err(|err| {
            tracing::error!(handle, error = %err, "Failed to store properties");
        })
    }

    /// Whether a volume is privileged.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeNotFound`] if the handle is not live.
    pub fn get_privileged(&self, handle: &str) -> ClaimResult<bool> {
        let _guard = self.locks.lock(handle);

        self.live_volume(handle)?.load_privileged()
    }

    /// Change whether a volume is privileged, remapping its data to match.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeNotFound`] if the handle is not live, or
    /// the namespacing error.
    pub fn set_privileged(&self, handle: &str, privileged: bool) -> ClaimResult<()> {
        let _guard = self.locks.lock(handle);

        let live = self.live_volume(handle)?;
        self.namespacer(privileged)
            .namespace_path(&live.data_path())
            .inspect_err(|err| {
                tracing::error!(handle, error = %err, "Failed to namespace volume");
            })?;
        live.store_privileged(privileged)
    }

    /// Extract an archive into `path` inside a volume.
    ///
    /// `limit` caps the encoded bytes read from `reader`; 0 means no cap.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::StreamLimitExceeded`] past the limit,
    /// [`ClaimError::BadStream`] for a malformed archive, or the
    /// infrastructure error.
    pub fn stream_in(
        &self,
        handle: &str,
        path: &str,
        encoding: Encoding,
        limit: u64,
        reader: &mut dyn Read,
    ) -> ClaimResult<()> {
        let live = self.live_volume(handle)?;
        let dest = live.data_path().join(sanitize_path(path));

        fs::create_dir_all(&dest).inspect_err(|err| {
            tracing::error!(handle, dest = %dest.display(), error = %err, "Failed to create destination");
        })?;

        let privileged = live.load_privileged()?;
        self.namespacer(privileged)
            .namespace_path(&live.data_path())?;

        let mut limited = LimitedReader::new(reader, limit);
        let result = self
            .streamers
            .get(encoding)
            .stream_in(&mut limited, &dest, privileged);

        match result {
            Err(_) if limited.exceeded() => {
                tracing::info!(handle, limit, "Stream exceeded limit");
                Err(ClaimError::StreamLimitExceeded { limit })
            }
            Err(err) => {
                tracing::error!(handle, %encoding, error = %err, "Failed to stream in");
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Write an archive of `path` inside a volume to `writer`.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::SourcePathNotFound`] if `path` does not exist in
    /// the volume.
    pub fn stream_out(
        &self,
        handle: &str,
        path: &str,
        encoding: Encoding,
        writer: &mut dyn Write,
    ) -> ClaimResult<()> {
        let live = self.live_volume(handle)?;
        let src = live.data_path().join(sanitize_path(path));
        ensure_source_exists(&src, path)?;

        let privileged = live.load_privileged()?;
        self.streamers
            .get(encoding)
            .stream_out(writer, &src, privileged)
            .inspect_err(|err| {
                tracing::error!(handle, %encoding, error = %err, "Failed to stream out");
            })
    }

    /// Stream `path` inside a volume straight into a peer's stream-in URL.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::Peer`] if the peer rejected the stream.
    pub fn stream_p2p_out(
        &self,
        handle: &str,
        path: &str,
        encoding: Encoding,
        stream_in_url: &str,
    ) -> ClaimResult<()> {
        let live = self.live_volume(handle)?;
        let src = live.data_path().join(sanitize_path(path));
        ensure_source_exists(&src, path)?;

        let privileged = live.load_privileged()?;
        stream_to_peer(self.streamers.get(encoding), &src, privileged, stream_in_url).inspect_err(
            |err| {
                tracing::error!(handle, url = stream_in_url, error = %err, "Failed to stream to peer");
            },
        )
    }

    /// The volume `handle` was layered on.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::VolumeNotFound`] if the handle is not live and
    /// [`ClaimError::VolumeCorrupted`] if the parent's metadata is unreadable.
    pub fn volume_parent(&self, handle: &str) -> ClaimResult<Option<Volume>> {
        let live = self.live_volume(handle)?;

        let Some(parent) = live.parent()? else {
            return Ok(None);
        };

        volume_from(&parent).map(Some).map_err(|err| {
            tracing::error!(handle, parent = parent.handle(), error = %err, "Failed to hydrate parent");
            ClaimError::VolumeCorrupted {
                handle: parent.handle().to_string(),
            }
        })
    }
}

fn volume_from(live: &LiveVolume) -> ClaimResult<Volume> {
    Ok(Volume {
        handle: live.handle().to_string(),
        path: live.data_path(),
        properties: live.load_properties()?,
        privileged: live.load_privileged()?,
    })
}

fn ensure_source_exists(src: &std::path::Path, requested: &str) -> ClaimResult<()> {
    match fs::symlink_metadata(src) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ClaimError::SourcePathNotFound {
            path: requested.to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}
