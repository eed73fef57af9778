//! Span-based trace aggregator: consumes an interleaved stream of
//! `TraceEvent`s from agent subprocesses and reconstructs a hierarchical
//! timeline per `trace_id`, tolerating out-of-order arrivals via an orphan
//! index (§4.2, §9 "Parent-before-child constraint relaxation").
//!
//! The aggregator's single lock is a [`std::sync::RwLock`]: a shared lock
//! for read-heavy queries (`get_recent_traces`, `get_active_trace`), an
//! exclusive lock for every mutation, matching §5 literally.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub type TraceId = String;
pub type SpanId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    LoopStart,
    LoopEnd,
    IterationStart,
    IterationEnd,
    ToolStart,
    ToolEnd,
}

/// The wire form of a trace event, as emitted by an agent subprocess and
/// consumed by the aggregator (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// Empty for the root span of a trace (`loop_start`).
    #[serde(default)]
    pub parent_id: SpanId,
    #[serde(rename = "type")]
    pub kind: TraceEventType,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// A timed, named interval within a trace. `duration = 0` is a deliberate
/// sentinel meaning "still open" (§9); implementations must not conflate it
/// with "instantaneous".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_id: SpanId,
    pub name: String,
    pub start: DateTime<Utc>,
    pub duration: chrono::Duration,
    pub attributes: HashMap<String, String>,
    pub children: Vec<Span>,
}

impl Span {
    fn new(event: &TraceEvent) -> Self {
        Self {
            trace_id: event.trace_id.clone(),
            span_id: event.span_id.clone(),
            parent_id: event.parent_id.clone(),
            name: event.name.clone(),
            start: event.timestamp,
            duration: chrono::Duration::zero(),
            attributes: event.attributes.clone(),
            children: Vec::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.duration.is_zero()
    }

    /// Depth-first search for the span identified by `span_id`, searching
    /// this span and its descendants.
    fn find_mut(&mut self, span_id: &str) -> Option<&mut Span> {
        if self.span_id == span_id {
            return Some(self);
        }
        for child in &mut self.children {
            if let Some(found) = child.find_mut(span_id) {
                return Some(found);
            }
        }
        None
    }

    /// Attach `orphans` (and transitively, anything waiting on them) under
    /// the span identified by `span_id`, wherever in the tree it lives.
    fn attach_orphans(&mut self, orphans: &mut HashMap<SpanId, Vec<Span>>) {
        if let Some(mut waiting) = orphans.remove(&self.span_id) {
            for child in &mut waiting {
                child.attach_orphans(orphans);
            }
            self.children.extend(waiting);
        }
        for child in &mut self.children {
            child.attach_orphans(orphans);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: TraceId,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub root: Span,
    pub status: TraceStatus,
}

/// Sink that completed traces are handed to, satisfying "the OTLP exporter
/// is a sink, specified only at its interface" (§1, §4.2). Implementations
/// must never let a failure propagate to the aggregator: log it out-of-band
/// instead (§7 `export_error`).
#[async_trait]
pub trait TraceExporter: Send + Sync {
    async fn export(&self, trace: &Trace);
}

/// Used when `OTEL_EXPORTER_OTLP_ENDPOINT` is unset: export is disabled and
/// calls are no-ops (§6).
#[derive(Debug, Default)]
pub struct NoopExporter;

#[async_trait]
impl TraceExporter for NoopExporter {
    async fn export(&self, _trace: &Trace) {}
}

/// POSTs a minimal OTLP/HTTP JSON payload built from the exported trace.
/// Export failures are logged via `tracing::warn!` and never bubbled up,
/// matching "never propagated" literally (§7).
pub struct OtlpHttpExporter {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl OtlpHttpExporter {
    pub fn new(endpoint: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            service_name: service_name.into(),
        }
    }

    /// Build from environment variables; returns `None` (caller should then
    /// use [`NoopExporter`]) when `OTEL_EXPORTER_OTLP_ENDPOINT` is unset.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "ralph".to_string());
        Some(Self::new(endpoint, service_name))
    }

    fn to_otlp_json(&self, trace: &Trace) -> serde_json::Value {
        fn span_json(span: &Span, trace_id: &str, service_name: &str) -> serde_json::Value {
            let mut spans = vec![serde_json::json!({
                "traceId": trace_id,
                "spanId": span.span_id,
                "parentSpanId": span.parent_id,
                "name": span.name,
                "startTimeUnixNano": span.start.timestamp_nanos_opt().unwrap_or_default(),
                "durationNanos": span.duration.num_nanoseconds().unwrap_or_default(),
                "attributes": span.attributes,
                "serviceName": service_name,
            })];
            for child in &span.children {
                if let Some(arr) = span_json(child, trace_id, service_name).as_array() {
                    spans.extend(arr.iter().cloned());
                }
            }
            serde_json::Value::Array(spans)
        }

        serde_json::json!({
            "resourceSpans": [{
                "resource": { "serviceName": self.service_name },
                "scopeSpans": [{
                    "spans": span_json(&trace.root, &trace.id, &self.service_name),
                }],
            }],
        })
    }
}

#[async_trait]
impl TraceExporter for OtlpHttpExporter {
    async fn export(&self, trace: &Trace) {
        let payload = self.to_otlp_json(trace);
        let timeout = std::time::Duration::from_secs(10);
        let result = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), trace_id = %trace.id, "otlp export rejected");
            }
            Err(e) => {
                warn!(error = %e, trace_id = %trace.id, "otlp export failed");
            }
            Ok(_) => {}
        }
    }
}

struct TraceState {
    trace: Trace,
    /// Spans awaiting a parent that has not yet been inserted, keyed by the
    /// `parent_id` they are waiting on.
    orphans: HashMap<SpanId, Vec<Span>>,
}

/// Thread-safe aggregator of `TraceEvent`s into a bounded recency buffer of
/// `Trace`s (§4.2).
pub struct TraceAggregator {
    inner: RwLock<Inner>,
    exporter: Arc<dyn TraceExporter>,
    max_traces: usize,
}

impl TraceAggregator {
    /// Recency buffer capacity when the caller doesn't override it (§3:
    /// "bounded recency buffer (capacity configurable, default 10)").
    pub const DEFAULT_MAX_TRACES: usize = 10;
}

struct Inner {
    traces: HashMap<TraceId, TraceState>,
    /// FIFO of trace ids, oldest first, bounding `traces` to `max_traces`.
    recency: VecDeque<TraceId>,
}

impl TraceAggregator {
    pub fn new(max_traces: usize, exporter: Arc<dyn TraceExporter>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                traces: HashMap::new(),
                recency: VecDeque::new(),
            }),
            exporter,
            max_traces,
        }
    }

    pub fn with_noop_exporter(max_traces: usize) -> Self {
        Self::new(max_traces, Arc::new(NoopExporter))
    }

    /// Consume one `TraceEvent`, mutating the span tree it belongs to.
    /// Export is triggered synchronously on `loop_end`.
    pub async fn ingest(&self, event: TraceEvent) {
        let export_target = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            self.ingest_locked(&mut inner, &event)
        };

        if let Some(trace) = export_target {
            self.exporter.export(&trace).await;
        }
    }

    /// Synchronous variant for call sites that are not `async` (kept
    /// distinct from `ingest` since export itself is genuinely async).
    fn ingest_locked(&self, inner: &mut Inner, event: &TraceEvent) -> Option<Trace> {
        match event.kind {
            TraceEventType::LoopStart => {
                self.handle_loop_start(inner, event);
                None
            }
            TraceEventType::IterationStart | TraceEventType::ToolStart => {
                self.handle_start(inner, event);
                None
            }
            TraceEventType::IterationEnd | TraceEventType::ToolEnd => {
                self.handle_end(inner, event);
                None
            }
            TraceEventType::LoopEnd => self.handle_loop_end(inner, event),
        }
    }

    fn ensure_trace<'a>(inner: &'a mut Inner, trace_id: &str, root: Span) -> &'a mut TraceState {
        inner.traces.entry(trace_id.to_string()).or_insert_with(|| TraceState {
            trace: Trace {
                id: trace_id.to_string(),
                start: root.start,
                end: None,
                root,
                status: TraceStatus::Running,
            },
            orphans: HashMap::new(),
        })
    }

    fn touch_recency(inner: &mut Inner, trace_id: &str, max_traces: usize) {
        if let Some(pos) = inner.recency.iter().position(|id| id == trace_id) {
            inner.recency.remove(pos);
        }
        inner.recency.push_back(trace_id.to_string());
        while inner.recency.len() > max_traces {
            if let Some(evicted) = inner.recency.pop_front() {
                inner.traces.remove(&evicted);
            }
        }
    }

    fn handle_loop_start(&self, inner: &mut Inner, event: &TraceEvent) {
        let root = Span::new(event);
        if let Some(state) = inner.traces.get_mut(&event.trace_id) {
            // A new loop_start for an existing trace_id replaces the start
            // and status but preserves already-attached children (§4.2). The
            // trace may already exist because a child event arrived first
            // and synthesized a placeholder root with an empty span_id; fix
            // the span_id up to the real one and drain anything that was
            // orphaned waiting on it.
            state.trace.start = event.timestamp;
            state.trace.status = TraceStatus::Running;
            state.trace.root.span_id = event.span_id.clone();
            state.trace.root.name = event.name.clone();
            state.trace.root.attributes = event.attributes.clone();
            state.trace.root.attach_orphans(&mut state.orphans);
        } else {
            Self::ensure_trace(inner, &event.trace_id, root);
        }
        Self::touch_recency(inner, &event.trace_id, self.max_traces);
    }

    fn handle_start(&self, inner: &mut Inner, event: &TraceEvent) {
        // An event may arrive for a trace whose loop_start has not been
        // seen yet; create the trace state on demand so the span has
        // somewhere to live, with a placeholder root that loop_start will
        // later reconcile (the root name/attributes are overwritten above
        // once loop_start does arrive).
        if !inner.traces.contains_key(&event.trace_id) {
            let placeholder_root = Span {
                trace_id: event.trace_id.clone(),
                span_id: String::new(),
                parent_id: String::new(),
                name: "<pending loop_start>".to_string(),
                start: event.timestamp,
                duration: chrono::Duration::zero(),
                attributes: HashMap::new(),
                children: Vec::new(),
            };
            Self::ensure_trace(inner, &event.trace_id, placeholder_root);
        }
        let state = inner.traces.get_mut(&event.trace_id).expect("just inserted");

        let mut span = Span::new(event);
        // Drain any orphans that were waiting specifically on this span.
        span.attach_orphans(&mut state.orphans);

        if let Some(parent) = state.trace.root.find_mut(&event.parent_id) {
            parent.children.push(span);
        } else {
            state.orphans.entry(event.parent_id.clone()).or_default().push(span);
        }
    }

    fn handle_end(&self, inner: &mut Inner, event: &TraceEvent) {
        let Some(state) = inner.traces.get_mut(&event.trace_id) else {
            // *_end without a matching trace/*_start is silently dropped.
            return;
        };
        let Some(span) = state.trace.root.find_mut(&event.span_id) else {
            return;
        };
        span.duration = event.timestamp - span.start;
        // Attributes from *_end overwrite equal-named attributes from
        // *_start.
        for (k, v) in &event.attributes {
            span.attributes.insert(k.clone(), v.clone());
        }
    }

    fn handle_loop_end(&self, inner: &mut Inner, event: &TraceEvent) -> Option<Trace> {
        let state = inner.traces.get_mut(&event.trace_id)?;
        state.trace.root.duration = event.timestamp - state.trace.root.start;
        for (k, v) in &event.attributes {
            state.trace.root.attributes.insert(k.clone(), v.clone());
        }
        state.trace.end = Some(event.timestamp);
        state.trace.status = TraceStatus::Completed;
        Some(state.trace.clone())
    }

    /// Shared-lock read: the most recently touched traces, most recent
    /// last.
    pub fn get_recent_traces(&self) -> Vec<Trace> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .recency
            .iter()
            .filter_map(|id| inner.traces.get(id).map(|s| s.trace.clone()))
            .collect()
    }

    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.traces.get(trace_id).map(|s| s.trace.clone())
    }

    /// The most recently touched trace still `running`, if any.
    pub fn get_active_trace(&self) -> Option<Trace> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .recency
            .iter()
            .rev()
            .filter_map(|id| inner.traces.get(id))
            .find(|s| s.trace.status == TraceStatus::Running)
            .map(|s| s.trace.clone())
    }

    pub fn trace_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.traces.len()
    }

    /// Number of orphan spans still unattached for `trace_id`, used by
    /// tests to assert the orphan-drain invariant.
    pub fn orphan_count(&self, trace_id: &str) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .traces
            .get(trace_id)
            .map(|s| s.orphans.values().map(|v| v.len()).sum())
            .unwrap_or(0)
    }
}
