//! Volume snapshots returned to callers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Arbitrary string tags attached to a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    /// Create an empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every key in `query` is present here with an equal value.
    ///
    /// An empty query is satisfied by any property set.
    #[must_use]
    pub fn has_properties(&self, query: &Self) -> bool {
        if query.len() > self.len() {
            return false;
        }

        query
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }

    /// Return a copy with `name` set to `value`.
    #[must_use]
    pub fn update_property(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut updated = self.clone();
        updated.0.insert(name.into(), value.into());
        updated
    }

    /// Look up a single property.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A point-in-time view of a live volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume handle.
    pub handle: String,
    /// Location of the usable data.
    pub path: PathBuf,
    /// Volume tags.
    pub properties: Properties,
    /// Whether container root maps to host root.
    pub privileged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs.iter().copied().collect()
    }

    #[test]
    fn empty_query_is_always_satisfied() {
        assert!(Properties::new().has_properties(&Properties::new()));
        assert!(props(&[("a", "b")]).has_properties(&Properties::new()));
    }

    #[test]
    fn matching_subset() {
        let set = props(&[("a", "1"), ("b", "2")]);
        assert!(set.has_properties(&props(&[("a", "1")])));
        assert!(set.has_properties(&props(&[("a", "1"), ("b", "2")])));
        assert!(!set.has_properties(&props(&[("a", "2")])));
        assert!(!set.has_properties(&props(&[("c", "1")])));
    }

    #[test]
    fn larger_query_is_never_satisfied() {
        let set = props(&[("a", "1")]);
        assert!(!set.has_properties(&props(&[("a", "1"), ("b", "2")])));
    }

    #[test]
    fn update_property_leaves_original_untouched() {
        let original = props(&[("a", "1")]);
        let updated = original.update_property("a", "2").update_property("b", "3");
        assert_eq!(original.get("a"), Some("1"));
        assert_eq!(updated.get("a"), Some("2"));
        assert_eq!(updated.get("b"), Some("3"));
        assert_eq!(updated.len(), 2);
    }

    #[test]
    fn serializes_as_flat_map() {
        let volume = Volume {
            handle: "some-handle".to_string(),
            path: PathBuf::from("/volumes/live/some-handle/volume"),
            properties: props(&[("some", "property")]),
            privileged: true,
        };
        let json = serde_json::to_value(&volume).unwrap();
        assert_eq!(json["properties"]["some"], "property");
        assert_eq!(json["privileged"], true);
        assert_eq!(json["path"], "/volumes/live/some-handle/volume");
    }

    proptest! {
        #[test]
        fn every_subset_is_satisfied(
            set in proptest::collection::btree_map("[a-z]{1,4}", "[a-z]{0,4}", 0..8),
            mask in proptest::collection::vec(any::<bool>(), 8),
        ) {
            let query: Properties = set
                .iter()
                .zip(mask.iter().cycle())
                .filter(|(_, keep)| **keep)
                .map(|((k, v), _)| (k.clone(), v.clone()))
                .collect();
            let set: Properties = set.into_iter().collect();
            prop_assert!(set.has_properties(&query));
        }

        #[test]
        fn changed_value_is_not_satisfied(
            set in proptest::collection::btree_map("[a-z]{1,4}", "[a-z]{0,4}", 1..8),
        ) {
            let (key, value) = set.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
            let query = Properties::new().update_property(key, format!("{value}-changed"));
            let set: Properties = set.into_iter().collect();
            prop_assert!(!set.has_properties(&query));
        }
    }
}
