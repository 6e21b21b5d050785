//! Request correlation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation data for one request routed to a snap.
///
/// The controller creates one per inbound request; child contexts are
/// derived for the runtime round trip and for any outbound RPC the snap
/// makes while handling it, so all log lines share a `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Unique identifier of this unit of work.
    pub request_id: Uuid,
    /// Shared by every context derived from the same inbound request.
    pub correlation_id: Uuid,
    /// Context this one was derived from.
    pub parent_id: Option<Uuid>,
    /// Component that created the context.
    pub source: String,
    /// Target snap.
    pub snap_id: Option<String>,
    /// Handler being invoked.
    pub handler: Option<String>,
    /// Caller origin.
    pub origin: Option<String>,
    /// Creation time.
    pub started_at: DateTime<Utc>,
}

impl RequestContext {
    /// Create a root context.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            request_id: id,
            correlation_id: id,
            parent_id: None,
            source: source.into(),
            snap_id: None,
            handler: None,
            origin: None,
            started_at: Utc::now(),
        }
    }

    /// Derive a child context that keeps the correlation id and target.
    #[must_use]
    pub fn child(&self, source: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            parent_id: Some(self.request_id),
            source: source.into(),
            started_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Set the target snap.
    #[must_use]
    pub fn with_snap(mut self, snap_id: impl Into<String>) -> Self {
        self.snap_id = Some(snap_id.into());
        self
    }

    /// Set the handler.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Set the caller origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Milliseconds since the context was created.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }

    /// A span carrying the correlation fields.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "snap_request",
            request_id = %self.request_id,
            correlation_id = %self.correlation_id,
            source = %self.source,
            snap_id = self.snap_id.as_deref(),
            handler = self.handler.as_deref(),
            origin = self.origin.as_deref(),
        )
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_context() {
        let ctx = RequestContext::new("controller");
        assert_eq!(ctx.request_id, ctx.correlation_id);
        assert!(ctx.parent_id.is_none());
        assert!(ctx.elapsed_ms() >= 0);
    }

    #[test]
    fn test_child_keeps_correlation_and_target() {
        let parent = RequestContext::new("controller")
            .with_snap("npm:example")
            .with_handler("onRpcRequest")
            .with_origin("https://dapp.example");
        let child = parent.child("execution");

        assert_ne!(child.request_id, parent.request_id);
        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.parent_id, Some(parent.request_id));
        assert_eq!(child.snap_id.as_deref(), Some("npm:example"));
        assert_eq!(child.source, "execution");
    }

    #[test]
    fn test_serialization() {
        let ctx = RequestContext::new("controller").with_handler("onCronjob");
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"handler\":\"onCronjob\""));
        let parsed: RequestContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.correlation_id, ctx.correlation_id);
    }
}
