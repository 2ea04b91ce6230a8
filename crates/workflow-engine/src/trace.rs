//! Trace and span propagation.
//!
//! A trace id is allocated at workflow creation and follows the workflow
//! through every envelope, row and log line. Each task publication opens a
//! fresh span whose parent is the workflow's span at the moment of publish;
//! handlers restore the context from the envelope before any user code runs.

use crate::envelope::TraceInfo;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
}

impl TraceContext {
    /// Root context for a new workflow; the root span has no parent.
    pub fn new_root() -> Self {
        Self { trace_id: Uuid::new_v4(), span_id: Uuid::new_v4(), parent_span_id: None }
    }

    /// Child span under this context, sharing the trace id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
        }
    }

    pub fn from_envelope(trace: &TraceInfo) -> Self {
        Self {
            trace_id: trace.trace_id,
            span_id: trace.span_id,
            parent_span_id: trace.parent_span_id,
        }
    }

    pub fn to_envelope(&self) -> TraceInfo {
        TraceInfo {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_spans_share_the_trace() {
        let root = TraceContext::new_root();
        assert!(root.parent_span_id.is_none());

        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));
        assert_ne!(child.span_id, root.span_id);

        let grandchild = child.child();
        assert_eq!(grandchild.trace_id, root.trace_id);
        assert_eq!(grandchild.parent_span_id, Some(child.span_id));
    }

    #[test]
    fn envelope_round_trip() {
        let context = TraceContext::new_root().child();
        let restored = TraceContext::from_envelope(&context.to_envelope());
        assert_eq!(restored, context);
    }
}
