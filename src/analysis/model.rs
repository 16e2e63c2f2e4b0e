use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// Server side of a call into the service.
    Entry,
    /// Client side of a call out to `peer`.
    Exit,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: i32,
    pub parent_span_id: i32,
    pub kind: SpanKind,
    pub operation: String,
    /// Called service for exit spans. Empty otherwise.
    #[serde(default)]
    pub peer: String,
    /// Client library or protocol, e.g. "http" or "grpc".
    #[serde(default)]
    pub component: String,
    /// Epoch milliseconds.
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub is_error: bool,
}

impl Span {
    pub fn duration_ms(&self) -> i64 {
        self.end_time.saturating_sub(self.start_time).max(0)
    }
}

/// Spans of one trace recorded by one service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSegment {
    pub trace_id: String,
    pub segment_id: String,
    pub service: String,
    pub instance: String,
    pub spans: Vec<Span>,
}

/// One served request, taken from an entry span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInvocation {
    pub service: String,
    pub instance: String,
    pub start_time: i64,
    pub duration_ms: i64,
    pub is_error: bool,
}

/// One service-to-service call, taken from an exit span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub source: String,
    pub dest: String,
    pub component: String,
    pub start_time: i64,
    pub duration_ms: i64,
    pub is_error: bool,
}

/// A span tagged with the segment's owner, as emitted by segment parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub service: String,
    pub instance: String,
    pub span: Span,
}

impl SpanEvent {
    pub fn into_invocation(self) -> Option<ServiceInvocation> {
        (self.span.kind == SpanKind::Entry).then(|| ServiceInvocation {
            duration_ms: self.span.duration_ms(),
            start_time: self.span.start_time,
            is_error: self.span.is_error,
            service: self.service,
            instance: self.instance,
        })
    }

    pub fn into_call(self) -> Option<ServiceCall> {
        if self.span.kind != SpanKind::Exit || self.span.peer.is_empty() {
            return None;
        }

        Some(ServiceCall {
            duration_ms: self.span.duration_ms(),
            start_time: self.span.start_time,
            is_error: self.span.is_error,
            source: self.service,
            dest: self.span.peer,
            component: self.span.component,
        })
    }
}

/// Periodic runtime sample reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSample {
    pub service: String,
    pub instance: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub heap_used: i64,
    pub gc_count: i64,
    #[serde(default)]
    pub agent_version: String,
}
