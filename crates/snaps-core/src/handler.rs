//! Snap handler entry points.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// An entry point a snap may export.
///
/// Each handler is gated by exactly one permission; a snap without that
/// permission never receives the corresponding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HandlerType {
    /// JSON-RPC requests from dapps or other snaps.
    #[serde(rename = "onRpcRequest")]
    OnRpcRequest,
    /// Invoked once after a successful install.
    #[serde(rename = "onInstall")]
    OnInstall,
    /// Invoked once after a successful update.
    #[serde(rename = "onUpdate")]
    OnUpdate,
    /// Periodic background jobs.
    #[serde(rename = "onCronjob")]
    OnCronjob,
    /// Transaction insight requests.
    #[serde(rename = "onTransaction")]
    OnTransaction,
    /// Requests routed through a multichain session namespace.
    #[serde(rename = "onNamespaceRequest")]
    OnNamespaceRequest,
}

/// Budget class used to pick a handler's round-trip timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutClass {
    /// Install/update hooks; typically the longest budget.
    Lifecycle,
    /// Interactive requests.
    Request,
    /// Scheduled background work.
    Background,
}

impl HandlerType {
    /// All handler types in declaration order.
    pub const ALL: [Self; 6] = [
        Self::OnRpcRequest,
        Self::OnInstall,
        Self::OnUpdate,
        Self::OnCronjob,
        Self::OnTransaction,
        Self::OnNamespaceRequest,
    ];

    /// Wire name of the handler export.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnRpcRequest => "onRpcRequest",
            Self::OnInstall => "onInstall",
            Self::OnUpdate => "onUpdate",
            Self::OnCronjob => "onCronjob",
            Self::OnTransaction => "onTransaction",
            Self::OnNamespaceRequest => "onNamespaceRequest",
        }
    }

    /// The permission a snap must hold to receive this handler's requests.
    #[must_use]
    pub fn required_permission(self) -> &'static str {
        match self {
            Self::OnRpcRequest => "endowment:rpc",
            Self::OnInstall | Self::OnUpdate => "endowment:lifecycle-hooks",
            Self::OnCronjob => "endowment:cronjob",
            Self::OnTransaction => "endowment:transaction-insight",
            Self::OnNamespaceRequest => "endowment:namespaces",
        }
    }

    /// Which timeout budget applies to this handler.
    #[must_use]
    pub fn timeout_class(self) -> TimeoutClass {
        match self {
            Self::OnInstall | Self::OnUpdate => TimeoutClass::Lifecycle,
            Self::OnCronjob => TimeoutClass::Background,
            Self::OnRpcRequest | Self::OnTransaction | Self::OnNamespaceRequest => {
                TimeoutClass::Request
            },
        }
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| CoreError::UnknownHandler(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for handler in HandlerType::ALL {
            assert_eq!(handler.as_str().parse::<HandlerType>().unwrap(), handler);
            let json = serde_json::to_string(&handler).unwrap();
            assert_eq!(json, format!("\"{}\"", handler.as_str()));
        }
    }

    #[test]
    fn unknown_handler_is_rejected() {
        assert!("onSomething".parse::<HandlerType>().is_err());
    }

    #[test]
    fn lifecycle_hooks_share_a_permission() {
        assert_eq!(
            HandlerType::OnInstall.required_permission(),
            HandlerType::OnUpdate.required_permission()
        );
        assert_eq!(HandlerType::OnInstall.timeout_class(), TimeoutClass::Lifecycle);
        assert_eq!(HandlerType::OnCronjob.timeout_class(), TimeoutClass::Background);
    }
}
