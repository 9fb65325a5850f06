//! Volume handle generation and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ClaimError, ClaimResult};

/// An opaque volume handle.
///
/// Handles are chosen by the caller or generated by the server. They name a
/// directory under each state directory, so they must:
/// - Be non-empty
/// - Not contain `/` or NUL
/// - Not be `.` or `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Create a handle, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot name a volume directory.
    pub fn new(handle: impl Into<String>) -> ClaimResult<Self> {
        let handle = handle.into();
        validate(&handle)?;
        Ok(Self(handle))
    }

    /// Generate a new random handle (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the handle, returning the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Check that a handle can safely name a volume directory.
///
/// # Errors
///
/// Returns [`ClaimError::InvalidHandle`] if it cannot.
pub fn validate(handle: &str) -> ClaimResult<()> {
    if handle.is_empty() || handle == "." || handle == ".." || handle.contains(['/', '\0']) {
        return Err(ClaimError::InvalidHandle {
            handle: handle.to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Handle {
    type Err = ClaimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_handles() {
        assert!(Handle::new("abc123").is_ok());
        assert!(Handle::new("some-handle").is_ok());
        assert!(Handle::new("9d3c8e1a-3b0f-4d7e-9a6c-2f1e0b7c5d4a").is_ok());
        assert!(Handle::new("..hidden").is_ok());
    }

    #[test]
    fn invalid_handles() {
        assert!(Handle::new("").is_err());
        assert!(Handle::new(".").is_err());
        assert!(Handle::new("..").is_err());
        assert!(Handle::new("a/b").is_err());
        assert!(Handle::new("../escape").is_err());
        assert!(Handle::new("nul\0").is_err());
    }

    #[test]
    fn generate_handle() {
        let a = Handle::generate();
        let b = Handle::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert!(validate(a.as_str()).is_ok());
    }
}
