//! Sessions pick one snap per requested namespace.

mod common;

use std::sync::Arc;

use common::{DAPP, MockApprovalHandler, SnapHost};
use serde_json::json;
use snaps_capabilities::builtin::endowments::NAMESPACES;
use snaps_controller::{ConflictResolver, ErrorKind, NamespaceMatcher};
use snaps_core::{HandlerType, JsonRpcRequest, PermissionRequest, SnapId};
use snaps_events::SnapEvent;
use snaps_test::fixtures::namespaces_caveat;
use snaps_test::{Behavior, ScriptedExecutor};

fn publish_serving(host: &SnapHost, id: &str, namespaces: &[&str]) -> SnapId {
    let namespaces: Vec<&str> = namespaces.to_vec();
    host.publish(id, "1.0.0", move |m| {
        m.initial_permissions.insert(
            NAMESPACES.into(),
            PermissionRequest::with_caveats(vec![namespaces_caveat(&namespaces)]),
        );
        m.handlers.insert(HandlerType::OnNamespaceRequest);
    })
}

fn wanted(namespaces: &[&str]) -> Vec<String> {
    namespaces.iter().map(|n| (*n).to_string()).collect()
}

#[tokio::test]
async fn contested_namespace_goes_to_first_registered() {
    let executor = ScriptedExecutor::new().on("chain_id", Behavior::Reply(json!("foo-1")));
    let host = SnapHost::new(executor, MockApprovalHandler::new());
    let first = publish_serving(&host, "npm:first", &["chain:foo"]);
    let second = publish_serving(&host, "npm:second", &["chain:foo", "chain:bar"]);
    host.install(&first, "*").await.unwrap();
    host.install(&second, "*").await.unwrap();
    let mut events = host.controller.events().subscribe();

    let matcher = NamespaceMatcher::new(host.controller.clone());
    assert_eq!(
        matcher.candidates("chain:foo").await,
        vec![first.clone(), second.clone()]
    );

    let session = matcher
        .open_session(&wanted(&["chain:foo", "chain:bar", "chain:baz"]))
        .await
        .unwrap();
    let matched = session.matched();
    assert_eq!(session.snap_for("chain:foo"), Some(&first));
    assert_eq!(session.snap_for("chain:bar"), Some(&second));
    assert_eq!(matched.unserviced, vec!["chain:baz".to_string()]);
    assert_eq!(matched.conflicts.len(), 1);
    assert_eq!(matched.conflicts[0].namespace, "chain:foo");
    assert_eq!(matched.conflicts[0].chosen, first);
    assert_eq!(matched.conflicts[0].rejected, vec![second.clone()]);

    let event = events.try_recv().unwrap();
    match event.as_ref() {
        SnapEvent::NamespaceConflict {
            namespace,
            chosen,
            rejected,
            ..
        } => {
            assert_eq!(namespace, "chain:foo");
            assert_eq!(chosen, &first);
            assert_eq!(rejected, &vec![second.clone()]);
        },
        other => panic!("expected a namespace conflict, got {}", other.event_type()),
    }

    assert_eq!(host.controller.get(&first).unwrap().active_references(), 1);
    assert_eq!(host.controller.get(&second).unwrap().active_references(), 1);

    let reply = session
        .route("chain:foo", DAPP, JsonRpcRequest::new(7, "chain_id", None))
        .await
        .unwrap();
    assert_eq!(reply, json!("foo-1"));
    let call = host.executor.calls().pop().unwrap();
    assert_eq!(call.snap_id, first);
    assert_eq!(call.handler, HandlerType::OnNamespaceRequest);

    let err = session
        .route("chain:baz", DAPP, JsonRpcRequest::new(8, "chain_id", None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    session.close().await;
    assert_eq!(host.controller.get(&first).unwrap().active_references(), 0);
    assert_eq!(host.controller.get(&second).unwrap().active_references(), 0);
}

struct Newest;

impl ConflictResolver for Newest {
    fn resolve(&self, _namespace: &str, candidates: &[SnapId]) -> Option<SnapId> {
        candidates.last().cloned()
    }
}

#[tokio::test]
async fn resolver_is_pluggable_and_disabled_snaps_drop_out() {
    let host = SnapHost::new(ScriptedExecutor::new(), MockApprovalHandler::new());
    let first = publish_serving(&host, "npm:old", &["chain:foo"]);
    let second = publish_serving(&host, "npm:new", &["chain:foo"]);
    host.install(&first, "*").await.unwrap();
    host.install(&second, "*").await.unwrap();

    let newest = NamespaceMatcher::new(host.controller.clone()).with_resolver(Arc::new(Newest));
    let matched = newest.match_namespaces(&wanted(&["chain:foo"])).await;
    assert_eq!(matched.assignments["chain:foo"], second);

    host.controller.disable_snap(&second).await.unwrap();
    let matched = newest.match_namespaces(&wanted(&["chain:foo"])).await;
    assert_eq!(matched.assignments["chain:foo"], first);
    assert!(matched.conflicts.is_empty());
}
