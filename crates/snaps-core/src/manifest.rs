//! Snap manifest types.
//!
//! The manifest is produced by an external loader; the core only consumes
//! the subset it needs: declared permissions, the bundle location and shasum,
//! and the handlers the snap exports.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::handler::HandlerType;

/// A typed restriction attached to a permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caveat {
    /// Caveat type name, e.g. `"rpcOrigin"`.
    #[serde(rename = "type")]
    pub caveat_type: String,
    /// Caveat value, interpreted by the caveat specification.
    pub value: Value,
}

impl Caveat {
    /// Create a caveat.
    #[must_use]
    pub fn new(caveat_type: impl Into<String>, value: Value) -> Self {
        Self {
            caveat_type: caveat_type.into(),
            value,
        }
    }
}

/// A permission requested by a manifest, with optional caveats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Caveats to attach to the grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveats: Option<Vec<Caveat>>,
}

impl PermissionRequest {
    /// A request with no caveats.
    #[must_use]
    pub fn bare() -> Self {
        Self { caveats: None }
    }

    /// A request carrying the given caveats.
    #[must_use]
    pub fn with_caveats(caveats: Vec<Caveat>) -> Self {
        Self {
            caveats: Some(caveats),
        }
    }

    /// Caveats as a slice (empty when none were requested).
    #[must_use]
    pub fn caveats(&self) -> &[Caveat] {
        self.caveats.as_deref().unwrap_or_default()
    }
}

/// Where the bundle lives relative to the snap location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapLocationRef {
    /// Path of the bundle within the location.
    pub file_path: String,
}

/// Source declaration: bundle location and its expected shasum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapSource {
    /// Base64-encoded SHA-256 of the bundle bytes.
    pub shasum: String,
    /// Where to find the bundle.
    pub location: SnapLocationRef,
}

fn default_manifest_version() -> String {
    "0.1".to_string()
}

/// The manifest of a snap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapManifest {
    /// Snap version.
    pub version: semver::Version,
    /// Display name proposed by the author.
    pub proposed_name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Bundle source.
    pub source: SnapSource,
    /// Permissions requested at install time.
    #[serde(default)]
    pub initial_permissions: BTreeMap<String, PermissionRequest>,
    /// Handlers the bundle exports.
    #[serde(default)]
    pub handlers: BTreeSet<HandlerType>,
    /// Manifest format version.
    #[serde(default = "default_manifest_version")]
    pub manifest_version: String,
}

impl SnapManifest {
    /// Parse a manifest from JSON and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or fails [`Self::validate`].
    pub fn from_json(bytes: &[u8]) -> CoreResult<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural validation of fields the core relies on.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidManifest`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        if self.proposed_name.trim().is_empty() {
            return Err(CoreError::InvalidManifest(
                "proposedName must not be empty".into(),
            ));
        }

        let decoded = STANDARD
            .decode(&self.source.shasum)
            .map_err(|e| CoreError::InvalidManifest(format!("shasum is not base64: {e}")))?;
        if decoded.len() != 32 {
            return Err(CoreError::InvalidManifest(format!(
                "shasum must encode 32 bytes, got {}",
                decoded.len()
            )));
        }

        let path = &self.source.location.file_path;
        if path.is_empty() {
            return Err(CoreError::InvalidManifest(
                "source.location.filePath must not be empty".into(),
            ));
        }
        if path.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(CoreError::InvalidManifest(format!(
                "source.location.filePath must not traverse parents: {path}"
            )));
        }
        Ok(())
    }

    /// Verify that `bundle` matches the declared shasum.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::HashMismatch`] if the digests differ.
    pub fn verify_source(&self, bundle: &[u8]) -> CoreResult<()> {
        let actual = shasum_of(bundle);
        if actual != self.source.shasum {
            return Err(CoreError::HashMismatch {
                expected: self.source.shasum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Whether the manifest declares the given handler.
    #[must_use]
    pub fn exports(&self, handler: HandlerType) -> bool {
        self.handlers.contains(&handler)
    }

    /// The requested caveats for `permission`, if the permission is requested.
    #[must_use]
    pub fn requested_caveats(&self, permission: &str) -> Option<&[Caveat]> {
        self.initial_permissions
            .get(permission)
            .map(PermissionRequest::caveats)
    }
}

/// Compute the base64 SHA-256 shasum of a bundle.
#[must_use]
pub fn shasum_of(bundle: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bundle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_json(shasum: &str) -> Value {
        json!({
            "version": "1.0.0",
            "proposedName": "Example",
            "source": {
                "shasum": shasum,
                "location": { "filePath": "dist/bundle.wasm" }
            },
            "initialPermissions": {
                "endowment:rpc": {
                    "caveats": [{ "type": "rpcOrigin", "value": { "dapps": true } }]
                },
                "snap_dialog": {}
            },
            "handlers": ["onRpcRequest"]
        })
    }

    #[test]
    fn parses_and_validates() {
        let bundle = b"bundle bytes";
        let raw = serde_json::to_vec(&manifest_json(&shasum_of(bundle))).unwrap();
        let manifest = SnapManifest::from_json(&raw).unwrap();

        assert_eq!(manifest.version, semver::Version::new(1, 0, 0));
        assert!(manifest.exports(HandlerType::OnRpcRequest));
        assert!(!manifest.exports(HandlerType::OnCronjob));
        assert_eq!(manifest.requested_caveats("endowment:rpc").unwrap().len(), 1);
        assert_eq!(manifest.requested_caveats("snap_dialog").unwrap().len(), 0);
        assert!(manifest.requested_caveats("snap_notify").is_none());
        manifest.verify_source(bundle).unwrap();
    }

    #[test]
    fn detects_hash_mismatch() {
        let raw = serde_json::to_vec(&manifest_json(&shasum_of(b"original"))).unwrap();
        let manifest = SnapManifest::from_json(&raw).unwrap();
        let err = manifest.verify_source(b"tampered").unwrap_err();
        assert!(matches!(err, CoreError::HashMismatch { .. }));
    }

    #[test]
    fn rejects_bad_shasum_and_paths() {
        let raw = serde_json::to_vec(&manifest_json("not-base64!")).unwrap();
        assert!(SnapManifest::from_json(&raw).is_err());

        let mut value = manifest_json(&shasum_of(b"x"));
        value["source"]["location"]["filePath"] = json!("../secrets");
        let raw = serde_json::to_vec(&value).unwrap();
        assert!(SnapManifest::from_json(&raw).is_err());
    }
}
