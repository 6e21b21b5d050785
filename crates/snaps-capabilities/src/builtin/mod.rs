//! Endowments and restricted methods every host registers.

pub mod endowments;
pub mod methods;

pub use methods::BuiltinHooks;

use crate::registry::CapabilityRegistryBuilder;

impl CapabilityRegistryBuilder {
    /// Register every built-in endowment and restricted method, plus the
    /// caveat types they accept. Restricted methods delegate to `hooks`.
    #[must_use]
    pub fn with_builtins(self, hooks: &BuiltinHooks) -> Self {
        let builder = endowments::specifications()
            .into_iter()
            .chain(methods::specifications(hooks))
            .fold(self, CapabilityRegistryBuilder::permission);
        endowments::caveat_specifications()
            .into_iter()
            .chain(methods::caveat_specifications())
            .fold(builder, CapabilityRegistryBuilder::caveat)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use snaps_core::{Caveat, SnapId};

    use super::methods::{
        DialogHook, DialogRequest, InMemoryStateStore, Notification, NotificationHook,
        SeedEntropySource,
    };
    use super::*;
    use crate::error::{CapabilityError, CapabilityResult};
    use crate::registry::CapabilityRegistry;
    use crate::spec::Permission;
    use crate::store::{Grants, InMemoryPermissionStore, PermissionStore};

    struct AlwaysConfirm;

    #[async_trait]
    impl DialogHook for AlwaysConfirm {
        async fn show_dialog(&self, _: &SnapId, _: DialogRequest) -> CapabilityResult<Value> {
            Ok(Value::Bool(true))
        }
    }

    struct Discard;

    #[async_trait]
    impl NotificationHook for Discard {
        async fn notify(&self, _: &SnapId, _: Notification) -> CapabilityResult<()> {
            Ok(())
        }
    }

    fn hooks() -> BuiltinHooks {
        BuiltinHooks {
            dialog: Arc::new(AlwaysConfirm),
            state: Arc::new(InMemoryStateStore::new()),
            entropy: Arc::new(SeedEntropySource::new([3; 32])),
            notify: Arc::new(Discard),
        }
    }

    #[test]
    fn builtins_build() {
        let registry = CapabilityRegistry::builder()
            .with_builtins(&hooks())
            .build()
            .unwrap();
        assert!(registry.is_endowment(endowments::RPC));
        assert!(registry.is_endowment(endowments::CRONJOB));
        assert!(registry.is_restricted_method(methods::DIALOG));
        assert!(registry.is_restricted_method(methods::GET_BIP44_ENTROPY));
        assert!(!registry.is_restricted_method(endowments::NETWORK_ACCESS));
    }

    #[tokio::test]
    async fn granted_methods_dispatch_through_hooks() {
        let registry = CapabilityRegistry::builder()
            .with_builtins(&hooks())
            .build()
            .unwrap();
        let store = InMemoryPermissionStore::new();
        let id = SnapId::from_static("npm:example");

        let err = registry
            .execute_restricted_method(&store, &id, methods::DIALOG, json!({}))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());

        let grants = Grants::from([
            (
                methods::DIALOG.to_string(),
                Permission::new(methods::DIALOG, Vec::new()),
            ),
            (
                methods::GET_BIP44_ENTROPY.to_string(),
                Permission::new(
                    methods::GET_BIP44_ENTROPY,
                    vec![Caveat::new(
                        methods::PERMITTED_COIN_TYPES_CAVEAT,
                        json!([{ "coinType": 60 }]),
                    )],
                ),
            ),
        ]);
        store.grant_permissions(&id, grants).await.unwrap();

        let answer = registry
            .execute_restricted_method(
                &store,
                &id,
                methods::DIALOG,
                json!({ "type": "confirmation", "content": "ok?" }),
            )
            .await
            .unwrap();
        assert_eq!(answer, Value::Bool(true));

        let entropy = registry
            .execute_restricted_method(
                &store,
                &id,
                methods::GET_BIP44_ENTROPY,
                json!({ "coinType": 60 }),
            )
            .await
            .unwrap();
        assert_eq!(entropy["coinType"], 60);
        assert!(entropy["entropy"].as_str().unwrap().starts_with("0x"));

        let err = registry
            .execute_restricted_method(
                &store,
                &id,
                methods::GET_BIP44_ENTROPY,
                json!({ "coinType": 0 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Unauthorized { .. }));
    }
}
