//! Container-ID to host-ID windows.

use std::fs;

use baggageclaim_common::{ClaimError, ClaimResult};

/// UID/GID mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    /// Container ID (start).
    pub container_id: u32,
    /// Host ID (start).
    pub host_id: u32,
    /// Range size.
    pub size: u32,
}

impl IdMap {
    /// Create a new ID mapping.
    #[must_use]
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Format for /proc/<pid>/uid_map or gid_map.
    #[must_use]
    pub fn to_proc_format(&self) -> String {
        format!("{} {} {}", self.container_id, self.host_id, self.size)
    }

    /// Format for `unshare --map-users` / `--map-groups`.
    #[must_use]
    pub fn to_unshare_format(&self) -> String {
        format!("{},{},{}", self.host_id, self.container_id, self.size)
    }
}

/// Which side of the privilege boundary a mapper translates towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    /// Container root is host root.
    Privileged,
    /// Container root is the highest valid host ID.
    Unprivileged,
}

/// Translates ownership between privileged and unprivileged volumes.
///
/// Only the root ID moves: an unprivileged mapper sends 0 to `max_id`, a
/// privileged mapper sends `max_id` back to 0. Every other ID is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapper {
    kind: MapperKind,
    max_id: u32,
}

impl Mapper {
    /// Mapper for privileged volumes.
    #[must_use]
    pub const fn privileged(max_id: u32) -> Self {
        Self {
            kind: MapperKind::Privileged,
            max_id,
        }
    }

    /// Mapper for unprivileged volumes.
    #[must_use]
    pub const fn unprivileged(max_id: u32) -> Self {
        Self {
            kind: MapperKind::Unprivileged,
            max_id,
        }
    }

    /// Build a mapper whose window ends at the highest ID valid for this
    /// process in both `/proc/self/uid_map` and `/proc/self/gid_map`.
    ///
    /// # Errors
    ///
    /// Returns an error if the maps cannot be read or are empty.
    pub fn detect(kind: MapperKind) -> ClaimResult<Self> {
        let uid_max = max_valid_id(&fs::read_to_string("/proc/self/uid_map")?)?;
        let gid_max = max_valid_id(&fs::read_to_string("/proc/self/gid_map")?)?;

        Ok(Self {
            kind,
            max_id: uid_max.min(gid_max),
        })
    }

    /// The translation direction.
    #[must_use]
    pub const fn kind(&self) -> MapperKind {
        self.kind
    }

    /// Highest valid host ID.
    #[must_use]
    pub const fn max_id(&self) -> u32 {
        self.max_id
    }

    /// Translate a single UID or GID.
    #[must_use]
    pub const fn map(&self, id: u32) -> u32 {
        match self.kind {
            MapperKind::Unprivileged if id == 0 => self.max_id,
            MapperKind::Privileged if id == self.max_id => 0,
            _ => id,
        }
    }

    /// User namespace mappings that run a process as this mapper's root.
    ///
    /// Empty for privileged mappers, which run in the host namespace.
    #[must_use]
    pub fn id_maps(&self) -> Vec<IdMap> {
        match self.kind {
            MapperKind::Privileged => Vec::new(),
            MapperKind::Unprivileged => vec![
                IdMap::new(0, self.max_id, 1),
                IdMap::new(1, 1, self.max_id.saturating_sub(1)),
            ],
        }
    }
}

/// Highest ID covered by the contents of a `uid_map`/`gid_map` file.
///
/// # Errors
///
/// Returns an error if no line parses.
pub fn max_valid_id(contents: &str) -> ClaimResult<u32> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace().map(str::parse::<u64>);
            let container = fields.next()?.ok()?;
            let _host = fields.next()?.ok()?;
            let size = fields.next()?.ok()?;
            let last = (container + size).checked_sub(1)?;
            Some(u32::try_from(last).unwrap_or(u32::MAX))
        })
        .max()
        .ok_or_else(|| ClaimError::Config {
            message: format!("no usable id mapping in {contents:?}"),
        })
}
