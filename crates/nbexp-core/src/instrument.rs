//! Optional instrumentation capability.
//!
//! Components receive an [`Instrumentation`] handle at construction. A handle
//! without a sink is a no-op: spans record nothing, attribute values are never
//! converted, and call sites look the same either way.
//!
//! Operation names emitted by the engine:
//! - `detect_version` (one per probe attempt, plus one overall)
//! - `fetch_storage`, `fetch_jobs` (one per full paginated sequence)
//! - `fetch_job_page` (one per jobs page)

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::field::Empty;
use tracing::{Span, debug, warn};

/// Attribute value attached to an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<&String> for AttrValue {
    fn from(v: &String) -> Self {
        AttrValue::Str(v.clone())
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<u16> for AttrValue {
    fn from(v: u16) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// Backend receiving operations. Implemented by tracing exporters.
pub trait InstrumentationSink: Send + Sync {
    /// Begins recording one named operation.
    fn start(&self, operation: &'static str) -> Box<dyn SpanRecorder>;

    /// Pushes buffered data out. Called once during shutdown.
    fn flush(&self) {}
}

/// Recorder for a single operation.
pub trait SpanRecorder: Send {
    fn attribute(&mut self, key: &'static str, value: AttrValue);
    fn record_error(&mut self, error: &dyn std::error::Error);
    fn finish(self: Box<Self>, elapsed: Duration);
}

/// Cloneable instrumentation handle. `Default` is the disabled handle.
#[derive(Clone, Default)]
pub struct Instrumentation {
    sink: Option<Arc<dyn InstrumentationSink>>,
}

impl Instrumentation {
    pub fn new(sink: Arc<dyn InstrumentationSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Starts an operation. The span finishes when dropped.
    pub fn span(&self, operation: &'static str) -> OpSpan {
        OpSpan {
            recorder: self.sink.as_ref().map(|s| s.start(operation)),
            started: Instant::now(),
        }
    }

    pub fn flush(&self) {
        if let Some(sink) = &self.sink {
            sink.flush();
        }
    }
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// In-progress operation. Reports its duration to the sink on drop.
pub struct OpSpan {
    recorder: Option<Box<dyn SpanRecorder>>,
    started: Instant,
}

impl OpSpan {
    pub fn attr<V: Into<AttrValue>>(&mut self, key: &'static str, value: V) {
        if let Some(r) = self.recorder.as_mut() {
            r.attribute(key, value.into());
        }
    }

    pub fn record_error(&mut self, error: &dyn std::error::Error) {
        if let Some(r) = self.recorder.as_mut() {
            r.record_error(error);
        }
    }
}

impl Drop for OpSpan {
    fn drop(&mut self) {
        if let Some(r) = self.recorder.take() {
            r.finish(self.started.elapsed());
        }
    }
}

/// Sink that records every operation as a `tracing` span.
///
/// Attributes land on the span as structured fields; keys outside the
/// declared set are dropped. The span closes with one event carrying the
/// duration and, for failed operations, the error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl InstrumentationSink for TracingSink {
    fn start(&self, operation: &'static str) -> Box<dyn SpanRecorder> {
        let span = tracing::info_span!(
            target: "nbexp::instrument",
            "operation",
            operation,
            endpoint = Empty,
            version = Empty,
            versions_attempted = Empty,
            status = Empty,
            offset = Empty,
            items = Empty,
            pages = Empty,
        );
        Box::new(TracingSpan { span, error: None })
    }
}

struct TracingSpan {
    span: Span,
    error: Option<String>,
}

impl SpanRecorder for TracingSpan {
    fn attribute(&mut self, key: &'static str, value: AttrValue) {
        match value {
            AttrValue::Str(s) => self.span.record(key, s.as_str()),
            AttrValue::Int(i) => self.span.record(key, i),
            AttrValue::Bool(b) => self.span.record(key, b),
        };
    }

    fn record_error(&mut self, error: &dyn std::error::Error) {
        self.error = Some(error.to_string());
    }

    fn finish(self: Box<Self>, elapsed: Duration) {
        let duration_ms = elapsed.as_millis() as u64;
        self.span.in_scope(|| match &self.error {
            Some(error) => warn!(
                target: "nbexp::instrument",
                duration_ms,
                error = %error,
                "operation failed"
            ),
            None => debug!(target: "nbexp::instrument", duration_ms, "operation finished"),
        });
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::testing::RecordingSink;
    use super::*;
    use crate::error::FetchError;

    #[test]
    fn disabled_handle_records_nothing() {
        let instr = Instrumentation::disabled();
        let mut span = instr.span("fetch_jobs");
        span.attr("items", 3usize);
        span.record_error(&FetchError::Closed);
        drop(span);
        instr.flush();
        assert!(!instr.is_enabled());
    }

    #[test]
    fn span_reports_attributes_and_error_on_drop() {
        let sink = Arc::new(RecordingSink::default());
        let instr = Instrumentation::new(sink.clone());
        {
            let mut span = instr.span("fetch_storage");
            span.attr("items", 7usize);
            span.attr("endpoint", "/storage/storage-units");
            span.record_error(&FetchError::Cancelled);
        }
        let spans = sink.spans_named("fetch_storage");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].attr("items"), Some(&AttrValue::Int(7)));
        assert_eq!(spans[0].error.as_deref(), Some("operation cancelled"));

        instr.flush();
        assert_eq!(*sink.flushes.lock().unwrap(), 1);
    }

    /// Collects every field recorded on spans and events as `name=value`.
    #[derive(Clone, Default)]
    struct Fields(Arc<Mutex<Vec<String>>>);

    impl Visit for Fields {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.lock().unwrap().push(format!("{}={:?}", field.name(), value));
        }
    }

    impl<S: Subscriber> Layer<S> for Fields {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
            attrs.record(&mut self.clone());
        }

        fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut self.clone());
        }

        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            event.record(&mut self.clone());
        }
    }

    #[test]
    fn tracing_sink_records_structured_fields() {
        let fields = Fields::default();
        let subscriber = tracing_subscriber::registry().with(fields.clone());
        tracing::subscriber::with_default(subscriber, || {
            let instr = Instrumentation::new(Arc::new(TracingSink));
            let mut span = instr.span("fetch_job_page");
            span.attr("endpoint", "/admin/jobs");
            span.attr("offset", 100u64);
            span.attr("unknown_key", true);
            span.record_error(&FetchError::Closed);
        });

        let recorded = fields.0.lock().unwrap().clone();
        assert!(recorded.contains(&r#"operation="fetch_job_page""#.to_string()));
        assert!(recorded.contains(&r#"endpoint="/admin/jobs""#.to_string()));
        assert!(recorded.contains(&"offset=100".to_string()));
        assert!(recorded.iter().any(|f| f.starts_with("duration_ms=")));
        assert!(recorded.iter().any(|f| f.starts_with("error=")));
        assert!(!recorded.iter().any(|f| f.starts_with("unknown_key")));
    }
}
