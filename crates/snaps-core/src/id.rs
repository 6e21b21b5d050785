//! Snap identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Maximum length of a snap identifier (npm's package-name limit plus prefix).
const MAX_SNAP_ID_LEN: usize = 214;

/// Recognized identifier prefixes. The prefix names where the bundle came from.
const PREFIXES: [&str; 2] = ["local:", "npm:"];

/// Unique, stable snap identifier.
///
/// Snap IDs look like `"npm:@acme/example-snap"` or
/// `"local:/opt/snaps/example"`. The prefix names the location the snap was
/// installed from; the remainder must be non-empty and free of whitespace
/// and control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SnapId(String);

/// Deserialize with validation so crafted persisted state cannot smuggle in
/// malformed IDs.
impl<'de> Deserialize<'de> for SnapId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl SnapId {
    /// Create a new `SnapId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidSnapId`] if the ID has no known prefix,
    /// an empty body, is too long, or contains whitespace/control characters.
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a `SnapId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The location prefix (`"local"` or `"npm"`).
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.split_once(':').map_or("", |(scheme, _)| scheme)
    }

    /// The identifier without its location prefix.
    #[must_use]
    pub fn location(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, rest)| rest)
    }

    fn validate(id: &str) -> CoreResult<()> {
        if id.len() > MAX_SNAP_ID_LEN {
            return Err(CoreError::InvalidSnapId(format!(
                "snap id exceeds {MAX_SNAP_ID_LEN} characters"
            )));
        }
        let Some(prefix) = PREFIXES.iter().find(|p| id.starts_with(**p)) else {
            return Err(CoreError::InvalidSnapId(format!(
                "snap id must start with one of {PREFIXES:?}, got: {id}"
            )));
        };
        let body = &id[prefix.len()..];
        if body.is_empty() {
            return Err(CoreError::InvalidSnapId(format!(
                "snap id has an empty location: {id}"
            )));
        }
        if body.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CoreError::InvalidSnapId(format!(
                "snap id must not contain whitespace or control characters, got: {id:?}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SnapId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_snap_ids() {
        assert!(SnapId::new("npm:@acme/example-snap").is_ok());
        assert!(SnapId::new("npm:example").is_ok());
        assert!(SnapId::new("local:/opt/snaps/example").is_ok());
        assert!(SnapId::new("local:http://localhost:8080").is_ok());
    }

    #[test]
    fn invalid_snap_ids() {
        assert!(SnapId::new("").is_err());
        assert!(SnapId::new("example").is_err());
        assert!(SnapId::new("npm:").is_err());
        assert!(SnapId::new("git:foo").is_err());
        assert!(SnapId::new("npm:foo bar").is_err());
        assert!(SnapId::new("npm:foo\n").is_err());
        assert!(SnapId::new(format!("npm:{}", "a".repeat(300))).is_err());
    }

    #[test]
    fn scheme_and_location() {
        let id = SnapId::new("npm:@acme/example-snap").unwrap();
        assert_eq!(id.scheme(), "npm");
        assert_eq!(id.location(), "@acme/example-snap");
    }

    #[test]
    fn deserialize_rejects_malformed_ids() {
        let ok: SnapId = serde_json::from_str("\"local:/tmp/snap\"").unwrap();
        assert_eq!(ok.as_str(), "local:/tmp/snap");
        assert!(serde_json::from_str::<SnapId>("\"../../etc/passwd\"").is_err());
    }
}
