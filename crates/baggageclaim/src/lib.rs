//! # Baggageclaim Volume Engine
//!
//! Baggageclaim manages copy-on-write filesystem volumes on a worker host.
//!
//! ## Features
//!
//! - **Volume lifecycle**: volumes move through `init`, `live` and `dead` directories atomically
//! - **Pluggable drivers**: naive copies, overlay mounts or btrfs snapshots
//! - **Streaming**: tar archives in and out of volumes, in gzip, zstd, s2 or raw encoding
//! - **User namespaces**: unprivileged volumes have their ownership shifted into a mapped id range
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use baggageclaim::driver::NaiveDriver;
//! use baggageclaim::filesystem::Filesystem;
//! use baggageclaim::namespace::{Namespacer, NoopNamespacer};
//! use baggageclaim::stream::Archiver;
//! use baggageclaim::{Properties, Strategy, VolumeRepository};
//! use baggageclaim_common::VolumePaths;
//!
//! # fn example() -> baggageclaim_common::ClaimResult<()> {
//! let filesystem = Filesystem::new(
//!     VolumePaths::with_root("/var/lib/baggageclaim/volumes"),
//!     Arc::new(NaiveDriver::new()),
//! )?;
//!
//! let noop: Arc<dyn Namespacer> = Arc::new(NoopNamespacer);
//! let repo = VolumeRepository::new(filesystem, Arc::clone(&noop), noop, &Archiver::default());
//!
//! // Create a volume, then a copy-on-write child of it
//! repo.create_volume("base", &Strategy::Empty, Properties::new(), false)?;
//! let child = Strategy::CopyOnWrite {
//!     parent: "base".to_string(),
//! };
//! repo.create_volume("child", &child, Properties::new(), false)?;
//!
//! // Tear both down
//! repo.destroy_volume_and_descendants("base")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod copy;
pub mod driver;
pub mod filesystem;
pub mod lock;
pub mod namespace;
pub mod promise;
pub mod repository;
pub mod strategy;
pub mod stream;
pub mod volume;

pub use promise::{Promise, PromiseList};
pub use repository::VolumeRepository;
pub use strategy::Strategy;
pub use volume::{Properties, Volume};
