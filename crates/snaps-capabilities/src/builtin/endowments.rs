//! Built-in endowments and their caveats.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snaps_core::{Caveat, SnapId};

use crate::error::{CapabilityError, CapabilityResult};
use crate::spec::{CaveatSpecification, NoGlobals, PermissionSpecification, StaticGlobals};

/// Gates `onRpcRequest`.
pub const RPC: &str = "endowment:rpc";
/// Grants network globals.
pub const NETWORK_ACCESS: &str = "endowment:network-access";
/// Gates `onCronjob` and declares the jobs.
pub const CRONJOB: &str = "endowment:cronjob";
/// Gates `onNamespaceRequest` and declares served namespaces.
pub const NAMESPACES: &str = "endowment:namespaces";
/// Gates `onInstall` and `onUpdate`.
pub const LIFECYCLE_HOOKS: &str = "endowment:lifecycle-hooks";
/// Gates `onTransaction`.
pub const TRANSACTION_INSIGHT: &str = "endowment:transaction-insight";

/// Caveat: which caller classes may reach `onRpcRequest`.
pub const RPC_ORIGIN_CAVEAT: &str = "rpcOrigin";
/// Caveat: the snap's periodic jobs.
pub const CRONJOB_CAVEAT: &str = "snapCronjob";
/// Caveat: namespaces the snap can service.
pub const CHAIN_NAMESPACES_CAVEAT: &str = "chainNamespaces";

/// Global name granted by network access.
pub const FETCH_GLOBAL: &str = "fetch";

fn invalid(permission: &str, reason: impl Into<String>) -> CapabilityError {
    CapabilityError::InvalidCaveat {
        permission: permission.to_string(),
        reason: reason.into(),
    }
}

fn require_exactly_one(
    permission: &'static str,
    caveat_type: &'static str,
) -> impl Fn(&[Caveat]) -> CapabilityResult<()> + Send + Sync + 'static {
    move |caveats| {
        let count = caveats
            .iter()
            .filter(|c| c.caveat_type == caveat_type)
            .count();
        if count == 1 {
            Ok(())
        } else {
            Err(invalid(
                permission,
                format!("expected exactly one '{caveat_type}' caveat, found {count}"),
            ))
        }
    }
}

// ---------------------------------------------------------------- rpcOrigin

/// Value of the `rpcOrigin` caveat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RpcOrigin {
    /// Web origins may call.
    #[serde(default)]
    pub dapps: bool,
    /// Other snaps may call.
    #[serde(default)]
    pub snaps: bool,
    /// When present, only these web origins may call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,
}

impl RpcOrigin {
    /// Whether a caller with this origin string is admitted. Origins that
    /// parse as snap ids are snaps; anything else is a dapp.
    #[must_use]
    pub fn admits(&self, origin: &str) -> bool {
        if SnapId::new(origin).is_ok() {
            return self.snaps;
        }
        if let Some(allowed) = &self.allowed_origins {
            return allowed.iter().any(|o| o == origin);
        }
        self.dapps
    }
}

struct RpcOriginCaveat;

impl CaveatSpecification for RpcOriginCaveat {
    fn caveat_type(&self) -> &str {
        RPC_ORIGIN_CAVEAT
    }

    fn validate(&self, permission: &str, caveat: &Caveat) -> CapabilityResult<()> {
        let origin: RpcOrigin = serde_json::from_value(caveat.value.clone())
            .map_err(|e| invalid(permission, format!("rpcOrigin: {e}")))?;
        if !origin.dapps && !origin.snaps && origin.allowed_origins.is_none() {
            return Err(invalid(
                permission,
                "rpcOrigin must admit dapps, snaps, or a list of origins",
            ));
        }
        Ok(())
    }
}

/// Whether the `endowment:rpc` caveats admit `origin`. No caveat admits nobody.
#[must_use]
pub fn rpc_origin_admits(caveats: &[Caveat], origin: &str) -> bool {
    caveats
        .iter()
        .find(|c| c.caveat_type == RPC_ORIGIN_CAVEAT)
        .and_then(|c| serde_json::from_value::<RpcOrigin>(c.value.clone()).ok())
        .is_some_and(|o| o.admits(origin))
}

// -------------------------------------------------------------- snapCronjob

/// The request a cron job sends to the snap's `onCronjob` handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronjobRequest {
    /// Method name passed to the handler.
    pub method: String,
    /// Optional params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// One periodic job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cronjob {
    /// Period between runs.
    pub interval_ms: u64,
    /// Request sent on each run.
    pub request: CronjobRequest,
}

#[derive(Deserialize)]
struct CronjobCaveatValue {
    jobs: Vec<Cronjob>,
}

/// Shortest permitted job period.
pub const MIN_CRONJOB_INTERVAL_MS: u64 = 1_000;

fn parse_cronjobs(permission: &str, value: &Value) -> CapabilityResult<Vec<Cronjob>> {
    let parsed: CronjobCaveatValue = serde_json::from_value(value.clone())
        .map_err(|e| invalid(permission, format!("snapCronjob: {e}")))?;
    if parsed.jobs.is_empty() {
        return Err(invalid(permission, "snapCronjob must declare at least one job"));
    }
    for job in &parsed.jobs {
        if job.interval_ms < MIN_CRONJOB_INTERVAL_MS {
            return Err(invalid(
                permission,
                format!("job interval must be at least {MIN_CRONJOB_INTERVAL_MS}ms"),
            ));
        }
        if job.request.method.is_empty() {
            return Err(invalid(permission, "job request method must not be empty"));
        }
    }
    Ok(parsed.jobs)
}

struct CronjobCaveat;

impl CaveatSpecification for CronjobCaveat {
    fn caveat_type(&self) -> &str {
        CRONJOB_CAVEAT
    }

    fn validate(&self, permission: &str, caveat: &Caveat) -> CapabilityResult<()> {
        parse_cronjobs(permission, &caveat.value).map(|_| ())
    }
}

/// Jobs declared by an `endowment:cronjob` grant.
///
/// # Errors
///
/// Returns [`CapabilityError::InvalidCaveat`] if the caveat is missing or
/// malformed.
pub fn cronjobs_from_caveats(caveats: &[Caveat]) -> CapabilityResult<Vec<Cronjob>> {
    let caveat = caveats
        .iter()
        .find(|c| c.caveat_type == CRONJOB_CAVEAT)
        .ok_or_else(|| invalid(CRONJOB, "missing snapCronjob caveat"))?;
    parse_cronjobs(CRONJOB, &caveat.value)
}

// --------------------------------------------------------- chainNamespaces

fn parse_namespaces(permission: &str, value: &Value) -> CapabilityResult<Vec<String>> {
    let namespaces: Vec<String> = serde_json::from_value(value.clone())
        .map_err(|e| invalid(permission, format!("chainNamespaces: {e}")))?;
    if namespaces.is_empty() {
        return Err(invalid(permission, "chainNamespaces must not be empty"));
    }
    if let Some(bad) = namespaces
        .iter()
        .find(|n| n.is_empty() || n.chars().any(char::is_whitespace))
    {
        return Err(invalid(permission, format!("invalid namespace '{bad}'")));
    }
    Ok(namespaces)
}

struct ChainNamespacesCaveat;

impl CaveatSpecification for ChainNamespacesCaveat {
    fn caveat_type(&self) -> &str {
        CHAIN_NAMESPACES_CAVEAT
    }

    fn validate(&self, permission: &str, caveat: &Caveat) -> CapabilityResult<()> {
        parse_namespaces(permission, &caveat.value).map(|_| ())
    }
}

/// Namespaces declared by an `endowment:namespaces` grant or request.
/// Empty when the caveat is absent or malformed.
#[must_use]
pub fn namespaces_from_caveats(caveats: &[Caveat]) -> Vec<String> {
    caveats
        .iter()
        .find(|c| c.caveat_type == CHAIN_NAMESPACES_CAVEAT)
        .and_then(|c| parse_namespaces(NAMESPACES, &c.value).ok())
        .unwrap_or_default()
}

/// Endowment specifications.
pub(crate) fn specifications() -> Vec<PermissionSpecification> {
    vec![
        PermissionSpecification::endowment(RPC, Arc::new(NoGlobals))
            .with_allowed_caveats([RPC_ORIGIN_CAVEAT])
            .with_validator(require_exactly_one(RPC, RPC_ORIGIN_CAVEAT)),
        PermissionSpecification::endowment(
            NETWORK_ACCESS,
            Arc::new(StaticGlobals(vec![FETCH_GLOBAL.to_string()])),
        ),
        PermissionSpecification::endowment(CRONJOB, Arc::new(NoGlobals))
            .with_allowed_caveats([CRONJOB_CAVEAT])
            .with_validator(require_exactly_one(CRONJOB, CRONJOB_CAVEAT)),
        PermissionSpecification::endowment(NAMESPACES, Arc::new(NoGlobals))
            .with_allowed_caveats([CHAIN_NAMESPACES_CAVEAT])
            .with_validator(require_exactly_one(NAMESPACES, CHAIN_NAMESPACES_CAVEAT)),
        PermissionSpecification::endowment(LIFECYCLE_HOOKS, Arc::new(NoGlobals)),
        PermissionSpecification::endowment(TRANSACTION_INSIGHT, Arc::new(NoGlobals)),
    ]
}

/// Caveat specifications used by the endowments.
pub(crate) fn caveat_specifications() -> Vec<Arc<dyn CaveatSpecification>> {
    vec![
        Arc::new(RpcOriginCaveat),
        Arc::new(CronjobCaveat),
        Arc::new(ChainNamespacesCaveat),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_origin_classifies_callers() {
        let dapps_only = RpcOrigin {
            dapps: true,
            ..RpcOrigin::default()
        };
        assert!(dapps_only.admits("https://dapp.example"));
        assert!(!dapps_only.admits("npm:other-snap"));

        let listed = RpcOrigin {
            allowed_origins: Some(vec!["https://a.example".into()]),
            ..RpcOrigin::default()
        };
        assert!(listed.admits("https://a.example"));
        assert!(!listed.admits("https://b.example"));

        let caveats = vec![Caveat::new(RPC_ORIGIN_CAVEAT, json!({ "snaps": true }))];
        assert!(rpc_origin_admits(&caveats, "npm:other-snap"));
        assert!(!rpc_origin_admits(&caveats, "https://dapp.example"));
        assert!(!rpc_origin_admits(&[], "https://dapp.example"));
    }

    #[test]
    fn rpc_origin_must_admit_someone() {
        let caveat = Caveat::new(RPC_ORIGIN_CAVEAT, json!({ "dapps": false }));
        assert!(RpcOriginCaveat.validate(RPC, &caveat).is_err());
        let caveat = Caveat::new(RPC_ORIGIN_CAVEAT, json!({ "dapps": true, "bogus": 1 }));
        assert!(RpcOriginCaveat.validate(RPC, &caveat).is_err());
    }

    #[test]
    fn cronjob_caveat_parsing() {
        let caveats = vec![Caveat::new(
            CRONJOB_CAVEAT,
            json!({ "jobs": [{ "intervalMs": 60000, "request": { "method": "tick" } }] }),
        )];
        let jobs = cronjobs_from_caveats(&caveats).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].request.method, "tick");

        let too_fast = Caveat::new(
            CRONJOB_CAVEAT,
            json!({ "jobs": [{ "intervalMs": 10, "request": { "method": "tick" } }] }),
        );
        assert!(CronjobCaveat.validate(CRONJOB, &too_fast).is_err());
        assert!(cronjobs_from_caveats(&[]).is_err());
    }

    #[test]
    fn namespaces_caveat_parsing() {
        let caveats = vec![Caveat::new(
            CHAIN_NAMESPACES_CAVEAT,
            json!(["chain:foo", "chain:bar"]),
        )];
        assert_eq!(namespaces_from_caveats(&caveats), vec!["chain:foo", "chain:bar"]);
        assert!(namespaces_from_caveats(&[]).is_empty());

        let bad = Caveat::new(CHAIN_NAMESPACES_CAVEAT, json!([]));
        assert!(ChainNamespacesCaveat.validate(NAMESPACES, &bad).is_err());
    }

    #[test]
    fn exactly_one_validator() {
        let check = require_exactly_one(RPC, RPC_ORIGIN_CAVEAT);
        assert!(check(&[]).is_err());
        assert!(check(&[Caveat::new(RPC_ORIGIN_CAVEAT, json!({ "dapps": true }))]).is_ok());
    }
}
