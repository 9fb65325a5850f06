//! Single-assignment results for asynchronous volume creation.

use std::sync::Arc;

use baggageclaim_common::{ClaimError, ClaimResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use crate::volume::Volume;

#[derive(Debug)]
enum PromiseState {
    Pending,
    Fulfilled(Volume),
    Rejected(Arc<ClaimError>),
}

/// The eventual outcome of a volume creation.
///
/// Settles exactly once, to either a volume or an error.
#[derive(Debug)]
pub struct Promise {
    state: Mutex<PromiseState>,
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl Promise {
    /// Create a pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PromiseState::Pending),
        }
    }

    /// Whether the promise has not settled yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), PromiseState::Pending)
    }

    /// The settled outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::PromiseStillPending`] before settlement.
    pub fn value(&self) -> ClaimResult<Result<Volume, Arc<ClaimError>>> {
        match &*self.state.lock() {
            PromiseState::Pending => Err(ClaimError::PromiseStillPending),
            PromiseState::Fulfilled(volume) => Ok(Ok(volume.clone())),
            PromiseState::Rejected(err) => Ok(Err(Arc::clone(err))),
        }
    }

    /// Settle with a volume.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::PromiseCanceled`] if the promise was canceled
    /// while pending, and [`ClaimError::PromiseNotPending`] if it had
    /// otherwise settled.
    pub fn fulfill(&self, volume: Volume) -> ClaimResult<()> {
        let mut state = self.state.lock();
        match &*state {
            PromiseState::Pending => {}
            PromiseState::Rejected(err) if matches!(**err, ClaimError::PromiseCanceled) => {
                return Err(ClaimError::PromiseCanceled);
            }
            _ => return Err(ClaimError::PromiseNotPending),
        }
        *state = PromiseState::Fulfilled(volume);
        Ok(())
    }

    /// Settle with an error.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::PromiseNotPending`] if already settled.
    pub fn reject(&self, err: ClaimError) -> ClaimResult<()> {
        let mut state = self.state.lock();
        if !matches!(*state, PromiseState::Pending) {
            return Err(ClaimError::PromiseNotPending);
        }
        *state = PromiseState::Rejected(Arc::new(err));
        Ok(())
    }
}

/// In-flight creations, at most one per handle.
#[derive(Debug, Default)]
pub struct PromiseList {
    promises: DashMap<String, Arc<Promise>>,
}

impl PromiseList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a promise for `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::PromiseAlreadyExists`] if one is registered.
    pub fn add_promise(&self, handle: &str, promise: Arc<Promise>) -> ClaimResult<()> {
        match self.promises.entry(handle.to_string()) {
            Entry::Occupied(_) => Err(ClaimError::PromiseAlreadyExists {
                handle: handle.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(promise);
                Ok(())
            }
        }
    }

    /// The promise registered for `handle`.
    #[must_use]
    pub fn get_promise(&self, handle: &str) -> Option<Arc<Promise>> {
        self.promises.get(handle).map(|p| Arc::clone(p.value()))
    }

    /// Forget the promise for `handle`.
    pub fn remove_promise(&self, handle: &str) {
        self.promises.remove(handle);
    }

    /// Number of registered promises.
    #[must_use]
    pub fn len(&self) -> usize {
        self.promises.len()
    }

    /// Whether no promise is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Properties;

    fn volume() -> Volume {
        Volume {
            handle: "h".to_string(),
            path: "/v/live/h/volume".into(),
            properties: Properties::new(),
            privileged: false,
        }
    }

    #[test]
    fn pending_until_settled() {
        let promise = Promise::new();
        assert!(promise.is_pending());
        assert!(matches!(
            promise.value(),
            Err(ClaimError::PromiseStillPending)
        ));

        promise.fulfill(volume()).unwrap();
        assert!(!promise.is_pending());
        assert_eq!(promise.value().unwrap().unwrap(), volume());
    }

    #[test]
    fn settles_only_once() {
        let promise = Promise::new();
        promise.reject(ClaimError::not_found("h")).unwrap();

        assert!(matches!(
            promise.fulfill(volume()),
            Err(ClaimError::PromiseNotPending)
        ));
        assert!(matches!(
            promise.reject(ClaimError::PromiseCanceled),
            Err(ClaimError::PromiseNotPending)
        ));
        assert!(promise.value().unwrap().unwrap_err().is_volume_not_found());
    }

    #[test]
    fn fulfil_after_cancel_reports_cancel() {
        let promise = Promise::new();
        promise.reject(ClaimError::PromiseCanceled).unwrap();
        assert!(matches!(
            promise.fulfill(volume()),
            Err(ClaimError::PromiseCanceled)
        ));
    }

    #[test]
    fn one_promise_per_handle() {
        let list = PromiseList::new();
        list.add_promise("h", Arc::new(Promise::new())).unwrap();
        assert!(matches!(
            list.add_promise("h", Arc::new(Promise::new())),
            Err(ClaimError::PromiseAlreadyExists { .. })
        ));

        assert!(list.get_promise("h").is_some());
        list.remove_promise("h");
        assert!(list.get_promise("h").is_none());
        assert!(list.is_empty());
    }
}
