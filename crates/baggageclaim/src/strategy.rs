//! How a new volume's initial content is produced.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use baggageclaim_common::{ClaimError, ClaimResult};
use serde::{Deserialize, Serialize};

use crate::copy::copy_tree;
use crate::filesystem::{Filesystem, FilesystemVolume, InitVolume};
use crate::stream::{Streamers, sniff};

/// Recipe for a new volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// A blank volume.
    Empty,
    /// A copy-on-write child of a live volume.
    CopyOnWrite {
        /// Handle of the parent volume.
        parent: String,
    },
    /// A copy of a host directory, or the extracted contents of a local
    /// tar archive.
    Import {
        /// Host path to import.
        path: PathBuf,
        /// Copy symlinks as their targets.
        follow_symlinks: bool,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StrategyPayload {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    follow_symlinks: bool,
}

impl Strategy {
    /// Decode a `{"type": ...}` payload.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::UnknownStrategy`] for an unrecognised type,
    /// [`ClaimError::NoParentVolumeProvided`] for `cow` without a volume, and
    /// [`ClaimError::InvalidStrategy`] for anything else malformed.
    pub fn from_json(value: serde_json::Value) -> ClaimResult<Self> {
        let payload: StrategyPayload =
            serde_json::from_value(value).map_err(|e| ClaimError::InvalidStrategy {
                message: e.to_string(),
            })?;

        match payload.kind.as_str() {
            "empty" => Ok(Self::Empty),
            "cow" => match payload.volume {
                Some(parent) if !parent.is_empty() => Ok(Self::CopyOnWrite { parent }),
                _ => Err(ClaimError::NoParentVolumeProvided),
            },
            "import" => match payload.path {
                Some(path) => Ok(Self::Import {
                    path,
                    follow_symlinks: payload.follow_symlinks,
                }),
                None => Err(ClaimError::InvalidStrategy {
                    message: "import strategy requires a path".to_string(),
                }),
            },
            other => Err(ClaimError::UnknownStrategy {
                kind: other.to_string(),
            }),
        }
    }

    /// Encode as a `{"type": ...}` payload.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let payload = match self {
            Self::Empty => StrategyPayload {
                kind: "empty".to_string(),
                ..StrategyPayload::default()
            },
            Self::CopyOnWrite { parent } => StrategyPayload {
                kind: "cow".to_string(),
                volume: Some(parent.clone()),
                ..StrategyPayload::default()
            },
            Self::Import {
                path,
                follow_symlinks,
            } => StrategyPayload {
                kind: "import".to_string(),
                path: Some(path.clone()),
                follow_symlinks: *follow_symlinks,
                ..StrategyPayload::default()
            },
        };
        serde_json::to_value(payload).unwrap_or_default()
    }

    /// Produce an `init` volume for `handle` with this strategy's content.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::ParentVolumeNotFound`] if a copy-on-write parent
    /// is not live, [`ClaimError::SourcePathNotFound`] for a missing import
    /// path, or the underlying filesystem or stream error.
    pub fn materialize(
        &self,
        handle: &str,
        filesystem: &Filesystem,
        streamers: &Streamers,
    ) -> ClaimResult<InitVolume> {
        match self {
            Self::Empty => filesystem.new_volume(handle),
            Self::CopyOnWrite { parent } => {
                if parent.is_empty() {
                    return Err(ClaimError::NoParentVolumeProvided);
                }
                let Some(parent_volume) = filesystem.lookup_volume(parent)? else {
                    return Err(ClaimError::ParentVolumeNotFound {
                        handle: parent.clone(),
                    });
                };
                parent_volume.new_subvolume(handle)
            }
            Self::Import {
                path,
                follow_symlinks,
            } => {
                if !path.exists() {
                    return Err(ClaimError::SourcePathNotFound {
                        path: path.display().to_string(),
                    });
                }

                let volume = filesystem.new_volume(handle)?;
                if let Err(err) = import(&volume, path, *follow_symlinks, streamers) {
                    if let Err(cleanup) = volume.destroy() {
                        tracing::error!(handle, error = %cleanup, "Failed to clean up import");
                    }
                    return Err(err);
                }
                Ok(volume)
            }
        }
    }
}

fn import(
    volume: &InitVolume,
    path: &std::path::Path,
    follow_symlinks: bool,
    streamers: &Streamers,
) -> ClaimResult<()> {
    if path.is_dir() {
        tracing::debug!(path = %path.display(), "Importing directory");
        return copy_tree(path, &volume.data_path(), follow_symlinks);
    }

    let mut reader = BufReader::new(File::open(path)?);
    let encoding = sniff(reader.fill_buf()?);
    tracing::debug!(path = %path.display(), %encoding, "Importing archive");

    streamers
        .get(encoding)
        .stream_in(&mut reader, &volume.data_path(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_every_strategy() {
        assert_eq!(
            Strategy::from_json(json!({"type": "empty"})).unwrap(),
            Strategy::Empty
        );
        assert_eq!(
            Strategy::from_json(json!({"type": "cow", "volume": "parent"})).unwrap(),
            Strategy::CopyOnWrite {
                parent: "parent".to_string()
            }
        );
        assert_eq!(
            Strategy::from_json(json!({"type": "import", "path": "/src", "follow_symlinks": true}))
                .unwrap(),
            Strategy::Import {
                path: PathBuf::from("/src"),
                follow_symlinks: true
            }
        );
    }

    #[test]
    fn rejects_bad_payloads() {
        assert!(matches!(
            Strategy::from_json(json!({"type": "bogus"})),
            Err(ClaimError::UnknownStrategy { .. })
        ));
        assert!(matches!(
            Strategy::from_json(json!({})),
            Err(ClaimError::UnknownStrategy { .. })
        ));
        assert!(matches!(
            Strategy::from_json(json!({"type": "cow"})),
            Err(ClaimError::NoParentVolumeProvided)
        ));
        assert!(matches!(
            Strategy::from_json(json!({"type": "import"})),
            Err(ClaimError::InvalidStrategy { .. })
        ));
    }

    #[test]
    fn encodes_as_tagged_payload() {
        let strategy = Strategy::CopyOnWrite {
            parent: "p".to_string(),
        };
        assert_eq!(strategy.to_json(), json!({"type": "cow", "volume": "p"}));
        assert_eq!(Strategy::from_json(strategy.to_json()).unwrap(), strategy);
        assert_eq!(Strategy::Empty.to_json(), json!({"type": "empty"}));
    }
}
