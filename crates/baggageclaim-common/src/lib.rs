//! # baggageclaim-common
//!
//! Shared utilities and types for the baggageclaim volume engine:
//! - The error taxonomy used across crates
//! - The on-disk volume layout
//! - Volume handle generation and validation

#![warn(missing_docs)]

pub mod error;
pub mod handle;
pub mod paths;

pub use error::{ClaimError, ClaimResult, ErrorClass};
pub use handle::Handle;
pub use paths::{OverlayPaths, VolumePaths};
