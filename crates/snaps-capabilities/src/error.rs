//! Capability error types.

use snaps_core::JsonRpcError;
use thiserror::Error;

/// Errors raised while validating grants or executing restricted methods.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    /// The caller lacks the permission, or a caveat rejected the call.
    ///
    /// Both cases deliberately share this one shape.
    #[error("unauthorized to perform action '{method}' for origin '{origin}'")]
    Unauthorized {
        /// Method or permission name.
        method: String,
        /// Caller origin.
        origin: String,
    },

    /// No specification is registered under this name.
    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    /// The name is registered but is not a callable restricted method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// A caveat type is not accepted by the permission.
    #[error("caveat type '{caveat_type}' is not allowed for permission '{permission}'")]
    DisallowedCaveat {
        /// Permission name.
        permission: String,
        /// Offending caveat type.
        caveat_type: String,
    },

    /// A caveat type appears more than once.
    #[error("duplicate caveat '{caveat_type}' on permission '{permission}'")]
    DuplicateCaveat {
        /// Permission name.
        permission: String,
        /// Repeated caveat type.
        caveat_type: String,
    },

    /// A caveat value or a permission's caveat set is malformed.
    #[error("invalid caveat on '{permission}': {reason}")]
    InvalidCaveat {
        /// Permission name.
        permission: String,
        /// What is wrong.
        reason: String,
    },

    /// Method parameters are malformed.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The user rejected a prompt.
    #[error("user rejected the request")]
    UserRejected,

    /// An injected host hook failed.
    #[error("host hook failed: {0}")]
    Hook(String),
}

impl CapabilityError {
    /// Shorthand for [`CapabilityError::Unauthorized`].
    #[must_use]
    pub fn unauthorized(method: impl Into<String>, origin: impl std::fmt::Display) -> Self {
        Self::Unauthorized {
            method: method.into(),
            origin: origin.to_string(),
        }
    }

    /// Whether this is the "not permitted" shape.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Whether this error stems from malformed input rather than policy.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownPermission(_)
                | Self::DisallowedCaveat { .. }
                | Self::DuplicateCaveat { .. }
                | Self::InvalidCaveat { .. }
                | Self::InvalidParams(_)
        )
    }

    /// Serialize for the runtime's RPC sub-channel.
    #[must_use]
    pub fn to_json_rpc(&self) -> JsonRpcError {
        let code = match self {
            Self::Unauthorized { .. } => JsonRpcError::UNAUTHORIZED,
            Self::MethodNotFound(_) | Self::UnknownPermission(_) => JsonRpcError::METHOD_NOT_FOUND,
            Self::DisallowedCaveat { .. }
            | Self::DuplicateCaveat { .. }
            | Self::InvalidCaveat { .. }
            | Self::InvalidParams(_) => JsonRpcError::INVALID_PARAMS,
            Self::UserRejected => JsonRpcError::USER_REJECTED,
            Self::Hook(_) => JsonRpcError::INTERNAL,
        };
        JsonRpcError::new(self.to_string()).with_code(code)
    }
}

/// Result type for capability operations.
pub type CapabilityResult<T> = Result<T, CapabilityError>;
