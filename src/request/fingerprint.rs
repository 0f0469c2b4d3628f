//! Stable request identity for deduplication.

use std::fmt;

/// Identity of a request, derived from its semantic parameters.
///
/// Two requests with the same fingerprint are the same logical request and
/// dedupe onto one in-flight operation; two distinct logical requests never
/// share a fingerprint. The registry and both cache tiers key by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint from an already-assembled identity string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Canonical fingerprint for a layer data request.
    ///
    /// `version` pins a catalog version; `None` addresses the latest, which
    /// is its own identity (a pinned request must not dedupe with an
    /// unpinned one even when they would resolve to the same version).
    pub fn from_parts(layer: &str, partition: &str, version: Option<u64>) -> Self {
        match version {
            Some(version) => Self(format!("{layer}::{partition}::{version}")),
            None => Self(format!("{layer}::{partition}::latest")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Fingerprint {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_parts_produce_identical_fingerprints() {
        let a = Fingerprint::from_parts("terrain", "23618402", Some(4));
        let b = Fingerprint::from_parts("terrain", "23618402", Some(4));
        assert_eq!(a, b);
    }

    #[test]
    fn any_differing_part_changes_the_fingerprint() {
        let base = Fingerprint::from_parts("terrain", "23618402", Some(4));
        assert_ne!(base, Fingerprint::from_parts("roads", "23618402", Some(4)));
        assert_ne!(base, Fingerprint::from_parts("terrain", "23618403", Some(4)));
        assert_ne!(base, Fingerprint::from_parts("terrain", "23618402", Some(5)));
    }

    #[test]
    fn latest_is_distinct_from_every_pinned_version() {
        let latest = Fingerprint::from_parts("terrain", "23618402", None);
        let pinned = Fingerprint::from_parts("terrain", "23618402", Some(4));
        assert_ne!(latest, pinned);
        assert_eq!(latest.as_str(), "terrain::23618402::latest");
    }

    #[test]
    fn raw_fingerprints_round_trip() {
        let fp = Fingerprint::new("https://example.com/layers/terrain/data");
        assert_eq!(fp.as_str(), "https://example.com/layers/terrain/data");
        assert_eq!(fp.to_string(), fp.as_str());
    }
}
