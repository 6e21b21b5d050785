//! Built-in restricted methods and the host hooks they delegate to.
//!
//! Each method holds its own hook; nothing is looked up globally, so tests can
//! hand every case its own fakes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snaps_core::{Caveat, SnapId};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{CapabilityError, CapabilityResult};
use crate::spec::{CaveatSpecification, PermissionSpecification, RestrictedMethod};

/// Show a dialog to the user.
pub const DIALOG: &str = "snap_dialog";
/// Read, write or clear the snap's persisted state.
pub const MANAGE_STATE: &str = "snap_manageState";
/// Derive per-snap entropy for a coin type.
pub const GET_BIP44_ENTROPY: &str = "snap_getBip44Entropy";
/// Send a notification.
pub const NOTIFY: &str = "snap_notify";

/// Caveat restricting `snap_getBip44Entropy` to listed coin types.
pub const PERMITTED_COIN_TYPES_CAVEAT: &str = "permittedCoinTypes";

/// Longest accepted notification message.
pub const MAX_NOTIFICATION_LEN: usize = 500;

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> CapabilityResult<T> {
    serde_json::from_value(params).map_err(|e| CapabilityError::InvalidParams(e.to_string()))
}

// ------------------------------------------------------------------ dialog

/// Dialog flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogType {
    /// Informational; resolves to `null`.
    Alert,
    /// Yes/no; resolves to a boolean.
    Confirmation,
    /// Free text; resolves to a string or `null`.
    Prompt,
}

/// A dialog to present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogRequest {
    /// Dialog flavour.
    #[serde(rename = "type")]
    pub dialog_type: DialogType,
    /// Opaque content rendered by the host UI.
    pub content: Value,
}

/// Presents dialogs. May suspend for as long as the user takes.
#[async_trait]
pub trait DialogHook: Send + Sync {
    /// Show `request` on behalf of `snap_id` and return the user's answer.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::UserRejected`] if the user dismissed it.
    async fn show_dialog(&self, snap_id: &SnapId, request: DialogRequest)
    -> CapabilityResult<Value>;
}

struct DialogMethod {
    hook: Arc<dyn DialogHook>,
}

#[async_trait]
impl RestrictedMethod for DialogMethod {
    async fn call(&self, origin: &SnapId, params: Value) -> CapabilityResult<Value> {
        let request: DialogRequest = parse_params(params)?;
        debug!(snap_id = %origin, dialog_type = ?request.dialog_type, "Showing dialog");
        self.hook.show_dialog(origin, request).await
    }
}

// ------------------------------------------------------------- manageState

/// Persisted per-snap state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state, if any.
    async fn get_state(&self, snap_id: &SnapId) -> CapabilityResult<Option<Value>>;
    /// Replace the state.
    async fn update_state(&self, snap_id: &SnapId, state: Value) -> CapabilityResult<()>;
    /// Delete the state.
    async fn clear_state(&self, snap_id: &SnapId) -> CapabilityResult<()>;
}

/// Process-local [`StateStore`].
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<SnapId, Value>>,
}

impl InMemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_state(&self, snap_id: &SnapId) -> CapabilityResult<Option<Value>> {
        Ok(self.states.read().await.get(snap_id).cloned())
    }

    async fn update_state(&self, snap_id: &SnapId, state: Value) -> CapabilityResult<()> {
        self.states.write().await.insert(snap_id.clone(), state);
        Ok(())
    }

    async fn clear_state(&self, snap_id: &SnapId) -> CapabilityResult<()> {
        self.states.write().await.remove(snap_id);
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
enum ManageStateParams {
    Get,
    Update {
        #[serde(rename = "newState")]
        new_state: Value,
    },
    Clear,
}

struct ManageStateMethod {
    store: Arc<dyn StateStore>,
}

#[async_trait]
impl RestrictedMethod for ManageStateMethod {
    async fn call(&self, origin: &SnapId, params: Value) -> CapabilityResult<Value> {
        match parse_params(params)? {
            ManageStateParams::Get => {
                Ok(self.store.get_state(origin).await?.unwrap_or(Value::Null))
            },
            ManageStateParams::Update { new_state } => {
                if !new_state.is_object() {
                    return Err(CapabilityError::InvalidParams(
                        "newState must be an object".into(),
                    ));
                }
                self.store.update_state(origin, new_state).await?;
                Ok(Value::Null)
            },
            ManageStateParams::Clear => {
                self.store.clear_state(origin).await?;
                Ok(Value::Null)
            },
        }
    }
}

// --------------------------------------------------------- getBip44Entropy

/// Derives deterministic per-snap key material.
pub trait EntropySource: Send + Sync {
    /// 32 bytes unique to `(snap_id, coin_type)`.
    fn derive(&self, snap_id: &SnapId, coin_type: u32) -> [u8; 32];
}

/// [`EntropySource`] keyed by a host seed with BLAKE3.
pub struct SeedEntropySource {
    seed: [u8; 32],
}

impl SeedEntropySource {
    /// Use `seed` as the derivation key.
    #[must_use]
    pub fn new(seed: [u8; 32]) -> Self {
        Self { seed }
    }
}

impl std::fmt::Debug for SeedEntropySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedEntropySource").finish_non_exhaustive()
    }
}

impl EntropySource for SeedEntropySource {
    fn derive(&self, snap_id: &SnapId, coin_type: u32) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(&self.seed);
        hasher.update(b"snaps/bip44/");
        hasher.update(snap_id.as_str().as_bytes());
        hasher.update(b"/");
        hasher.update(&coin_type.to_be_bytes());
        *hasher.finalize().as_bytes()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bip44Params {
    coin_type: u32,
}

struct Bip44EntropyMethod {
    source: Arc<dyn EntropySource>,
}

#[async_trait]
impl RestrictedMethod for Bip44EntropyMethod {
    async fn call(&self, origin: &SnapId, params: Value) -> CapabilityResult<Value> {
        let Bip44Params { coin_type } = parse_params(params)?;
        let entropy = self.source.derive(origin, coin_type);
        Ok(json!({
            "coinType": coin_type,
            "entropy": format!("0x{}", blake3::Hash::from(entropy).to_hex()),
        }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermittedCoinType {
    coin_type: u32,
}

fn parse_coin_types(permission: &str, value: &Value) -> CapabilityResult<Vec<u32>> {
    let entries: Vec<PermittedCoinType> =
        serde_json::from_value(value.clone()).map_err(|e| CapabilityError::InvalidCaveat {
            permission: permission.to_string(),
            reason: format!("permittedCoinTypes: {e}"),
        })?;
    if entries.is_empty() {
        return Err(CapabilityError::InvalidCaveat {
            permission: permission.to_string(),
            reason: "permittedCoinTypes must not be empty".into(),
        });
    }
    Ok(entries.into_iter().map(|e| e.coin_type).collect())
}

struct PermittedCoinTypesCaveat;

impl CaveatSpecification for PermittedCoinTypesCaveat {
    fn caveat_type(&self) -> &str {
        PERMITTED_COIN_TYPES_CAVEAT
    }

    fn validate(&self, permission: &str, caveat: &Caveat) -> CapabilityResult<()> {
        parse_coin_types(permission, &caveat.value).map(|_| ())
    }

    fn decorate(
        &self,
        permission: &str,
        method: Arc<dyn RestrictedMethod>,
        caveat: &Caveat,
    ) -> CapabilityResult<Arc<dyn RestrictedMethod>> {
        Ok(Arc::new(CoinTypeGuard {
            permission: permission.to_string(),
            permitted: parse_coin_types(permission, &caveat.value)?,
            inner: method,
        }))
    }
}

struct CoinTypeGuard {
    permission: String,
    permitted: Vec<u32>,
    inner: Arc<dyn RestrictedMethod>,
}

#[async_trait]
impl RestrictedMethod for CoinTypeGuard {
    async fn call(&self, origin: &SnapId, params: Value) -> CapabilityResult<Value> {
        let requested = params
            .get("coinType")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        match requested {
            Some(coin_type) if self.permitted.contains(&coin_type) => {
                self.inner.call(origin, params).await
            },
            _ => Err(CapabilityError::unauthorized(&self.permission, origin)),
        }
    }
}

// ------------------------------------------------------------------ notify

/// Where a notification is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    /// Inside the host UI.
    InApp,
    /// Through the operating system.
    Native,
}

/// A notification to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Delivery channel.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Message text.
    pub message: String,
}

/// Delivers notifications.
#[async_trait]
pub trait NotificationHook: Send + Sync {
    /// Deliver `notification` from `snap_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::Hook`] if delivery fails.
    async fn notify(&self, snap_id: &SnapId, notification: Notification) -> CapabilityResult<()>;
}

struct NotifyMethod {
    hook: Arc<dyn NotificationHook>,
}

#[async_trait]
impl RestrictedMethod for NotifyMethod {
    async fn call(&self, origin: &SnapId, params: Value) -> CapabilityResult<Value> {
        let notification: Notification = parse_params(params)?;
        if notification.message.trim().is_empty() {
            return Err(CapabilityError::InvalidParams("message must not be empty".into()));
        }
        if notification.message.chars().count() > MAX_NOTIFICATION_LEN {
            return Err(CapabilityError::InvalidParams(format!(
                "message must be at most {MAX_NOTIFICATION_LEN} characters"
            )));
        }
        self.hook.notify(origin, notification).await?;
        Ok(Value::Null)
    }
}

// ------------------------------------------------------------ registration

/// Host hooks the built-in restricted methods delegate to.
#[derive(Clone)]
pub struct BuiltinHooks {
    /// Backs `snap_dialog`.
    pub dialog: Arc<dyn DialogHook>,
    /// Backs `snap_manageState`.
    pub state: Arc<dyn StateStore>,
    /// Backs `snap_getBip44Entropy`.
    pub entropy: Arc<dyn EntropySource>,
    /// Backs `snap_notify`.
    pub notify: Arc<dyn NotificationHook>,
}

impl std::fmt::Debug for BuiltinHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinHooks").finish_non_exhaustive()
    }
}

pub(crate) fn specifications(hooks: &BuiltinHooks) -> Vec<PermissionSpecification> {
    vec![
        PermissionSpecification::restricted_method(
            DIALOG,
            Arc::new(DialogMethod {
                hook: Arc::clone(&hooks.dialog),
            }),
        ),
        PermissionSpecification::restricted_method(
            MANAGE_STATE,
            Arc::new(ManageStateMethod {
                store: Arc::clone(&hooks.state),
            }),
        ),
        PermissionSpecification::restricted_method(
            GET_BIP44_ENTROPY,
            Arc::new(Bip44EntropyMethod {
                source: Arc::clone(&hooks.entropy),
            }),
        )
        .with_allowed_caveats([PERMITTED_COIN_TYPES_CAVEAT]),
        PermissionSpecification::restricted_method(
            NOTIFY,
            Arc::new(NotifyMethod {
                hook: Arc::clone(&hooks.notify),
            }),
        ),
    ]
}

pub(crate) fn caveat_specifications() -> Vec<Arc<dyn CaveatSpecification>> {
    vec![Arc::new(PermittedCoinTypesCaveat)]
}
