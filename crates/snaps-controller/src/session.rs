//! Multichain sessions: which snap serves which chain namespace.
//!
//! A dapp opens a session over a list of namespaces (`eip155`, `solana`,
//! ...). Each namespace is assigned to at most one runnable snap holding an
//! `endowment:namespaces` grant that lists it. When several snaps claim the
//! same namespace a [`ConflictResolver`] picks one and the conflict is
//! reported, never silently dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use snaps_capabilities::builtin::endowments::{NAMESPACES, namespaces_from_caveats};
use snaps_core::{HandlerType, JsonRpcRequest, SnapId};
use snaps_events::{EventMetadata, SnapEvent};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::{SnapController, SnapRequest};
use crate::error::{SnapError, SnapResult};

/// Picks one snap when several claim a namespace.
pub trait ConflictResolver: Send + Sync {
    /// Choose from `candidates`, in install order. `None`, or a snap that is
    /// not a candidate, falls back to the first candidate.
    fn resolve(&self, namespace: &str, candidates: &[SnapId]) -> Option<SnapId>;
}

/// The earliest-installed snap wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstRegistered;

impl ConflictResolver for FirstRegistered {
    fn resolve(&self, namespace: &str, candidates: &[SnapId]) -> Option<SnapId> {
        debug!(namespace, ?candidates, "Resolving namespace conflict by install order");
        candidates.first().cloned()
    }
}

/// Several snaps claimed one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceConflict {
    /// The contested namespace.
    pub namespace: String,
    /// The snap that serves it.
    pub chosen: SnapId,
    /// The snaps that lost.
    pub rejected: Vec<SnapId>,
}

/// Outcome of matching a namespace list against the installed snaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMatch {
    /// Namespace to serving snap.
    pub assignments: BTreeMap<String, SnapId>,
    /// Namespaces no snap serves, in request order.
    pub unserviced: Vec<String>,
    /// Every conflict that was resolved.
    pub conflicts: Vec<NamespaceConflict>,
}

impl NamespaceMatch {
    /// Distinct snaps serving at least one namespace.
    #[must_use]
    pub fn snaps(&self) -> BTreeSet<SnapId> {
        self.assignments.values().cloned().collect()
    }
}

/// Matches namespaces to snaps and opens sessions.
#[derive(Clone)]
pub struct NamespaceMatcher {
    controller: SnapController,
    resolver: Arc<dyn ConflictResolver>,
}

impl std::fmt::Debug for NamespaceMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceMatcher").finish_non_exhaustive()
    }
}

impl NamespaceMatcher {
    /// Match against `controller`'s snaps, resolving conflicts with
    /// [`FirstRegistered`].
    #[must_use]
    pub fn new(controller: SnapController) -> Self {
        Self {
            controller,
            resolver: Arc::new(FirstRegistered),
        }
    }

    /// Use a different conflict policy.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Runnable snaps granted each namespace, in install order.
    async fn claims(&self) -> BTreeMap<String, Vec<SnapId>> {
        let mut claims: BTreeMap<String, Vec<SnapId>> = BTreeMap::new();
        for snap in self.controller.runnable_snaps() {
            let Some(grant) = self
                .controller
                .permissions()
                .get_permission(snap.id(), NAMESPACES)
                .await
            else {
                continue;
            };
            for namespace in namespaces_from_caveats(&grant.caveats) {
                claims.entry(namespace).or_default().push(snap.id().clone());
            }
        }
        claims
    }

    /// Snaps that could serve `namespace`, in install order.
    pub async fn candidates(&self, namespace: &str) -> Vec<SnapId> {
        self.claims()
            .await
            .remove(namespace)
            .unwrap_or_default()
    }

    /// Assign each namespace to one snap. Duplicate namespaces are matched
    /// once. Publishes a [`SnapEvent::NamespaceConflict`] per conflict.
    pub async fn match_namespaces(&self, namespaces: &[String]) -> NamespaceMatch {
        let claims = self.claims().await;
        let mut result = NamespaceMatch::default();
        let mut seen = BTreeSet::new();

        for namespace in namespaces {
            if !seen.insert(namespace.as_str()) {
                continue;
            }
            let candidates = claims.get(namespace).map(Vec::as_slice).unwrap_or_default();
            let chosen = match candidates {
                [] => {
                    result.unserviced.push(namespace.clone());
                    continue;
                },
                [only] => only.clone(),
                [first, ..] => {
                    let chosen = match self.resolver.resolve(namespace, candidates) {
                        Some(chosen) if candidates.contains(&chosen) => chosen,
                        other => {
                            warn!(namespace, ?other, "Resolver gave no candidate; using the first");
                            first.clone()
                        },
                    };
                    let rejected: Vec<SnapId> = candidates
                        .iter()
                        .filter(|c| **c != chosen)
                        .cloned()
                        .collect();
                    info!(namespace, %chosen, ?rejected, "Namespace claimed by several snaps");
                    self.controller.events().publish(SnapEvent::NamespaceConflict {
                        metadata: EventMetadata::new("snaps-controller"),
                        namespace: namespace.clone(),
                        chosen: chosen.clone(),
                        rejected: rejected.clone(),
                    });
                    result.conflicts.push(NamespaceConflict {
                        namespace: namespace.clone(),
                        chosen: chosen.clone(),
                        rejected,
                    });
                    chosen
                },
            };
            result.assignments.insert(namespace.clone(), chosen);
        }
        result
    }

    /// Match `namespaces` and hold a reference on every serving snap for the
    /// life of the session.
    ///
    /// # Errors
    ///
    /// Returns an error if a serving snap disappears while references are
    /// taken; references already taken are released.
    pub async fn open_session(&self, namespaces: &[String]) -> SnapResult<Session> {
        let matched = self.match_namespaces(namespaces).await;
        let mut referenced = Vec::new();
        for snap_id in matched.snaps() {
            if let Err(e) = self.controller.increment_active_references(&snap_id) {
                release(&self.controller, std::mem::take(&mut referenced)).await;
                return Err(e);
            }
            referenced.push(snap_id);
        }

        let session = Session {
            id: Uuid::new_v4(),
            controller: self.controller.clone(),
            matched,
            referenced,
        };
        info!(session_id = %session.id, snaps = session.referenced.len(), "Session opened");
        Ok(session)
    }
}

async fn release(controller: &SnapController, snaps: Vec<SnapId>) {
    for snap_id in snaps {
        if let Err(e) = controller.decrement_active_references(&snap_id).await {
            debug!(snap_id = %snap_id, error = %e, "Reference already gone");
        }
    }
}

/// An open multichain session.
///
/// Close it with [`Session::close`]. Dropping it releases the references in
/// a background task when a runtime is available.
pub struct Session {
    id: Uuid,
    controller: SnapController,
    matched: NamespaceMatch,
    referenced: Vec<SnapId>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("matched", &self.matched)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Session id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// How the namespaces were matched.
    #[must_use]
    pub fn matched(&self) -> &NamespaceMatch {
        &self.matched
    }

    /// The snap serving `namespace`.
    #[must_use]
    pub fn snap_for(&self, namespace: &str) -> Option<&SnapId> {
        self.matched.assignments.get(namespace)
    }

    /// Send `request` to the snap serving `namespace` as an
    /// `onNamespaceRequest`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::Validation`] for an unserved namespace, or the
    /// controller's error.
    pub async fn route(
        &self,
        namespace: &str,
        origin: &str,
        request: JsonRpcRequest,
    ) -> SnapResult<Value> {
        let snap_id = self.snap_for(namespace).ok_or_else(|| {
            SnapError::Validation(format!("no snap serves namespace '{namespace}'"))
        })?;
        self.controller
            .handle_request(SnapRequest::new(
                snap_id.clone(),
                origin,
                HandlerType::OnNamespaceRequest,
                request,
            ))
            .await
    }

    /// Release the session's references.
    pub async fn close(mut self) {
        let snaps = std::mem::take(&mut self.referenced);
        release(&self.controller, snaps).await;
        info!(session_id = %self.id, "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.referenced.is_empty() {
            return;
        }
        let snaps = std::mem::take(&mut self.referenced);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let controller = self.controller.clone();
                handle.spawn(async move { release(&controller, snaps).await });
            },
            Err(_) => warn!(
                session_id = %self.id,
                "Session dropped outside a runtime; references leak"
            ),
        }
    }
}
