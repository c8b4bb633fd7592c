use crate::models::record::{Envelope, ExceptionRecord, MetricRecord, Record, Tags, TransactionRecord};
use crate::util::ring_buffer::RingBuffer;
use chrono::Utc;
use serde::Serialize;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::time::Instant;
use uuid::Uuid;

/// The ring has no lock of its own; every user goes through this mutex.
pub type SharedRing<T> = Arc<Mutex<RingBuffer<T>>>;

pub fn shared(ring: RingBuffer<Envelope>) -> SharedRing<Envelope> {
    Arc::new(Mutex::new(ring))
}

/// Lock the ring, recovering the guard if a previous holder panicked.
pub fn lock<T>(ring: &SharedRing<T>) -> MutexGuard<'_, RingBuffer<T>> {
    ring.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Largest request body prefix copied into the `body` tag.
pub const BODY_LIMIT_FOR_REPORTING: usize = 64 * 1024;

/// Which parts of the request are copied into transaction tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recording(u8);

impl Recording {
    pub const NONE:   Recording = Recording(0);
    pub const URL:    Recording = Recording(1 << 0);
    pub const QUERY:  Recording = Recording(1 << 1);
    pub const BODY:   Recording = Recording(1 << 2);
    pub const HEADER: Recording = Recording(1 << 3);

    pub fn contains(self, other: Recording) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Parse config names ("url", "query", "body", "header"). Unknown names are ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        names.iter().fold(Recording::NONE, |acc, name| {
            let flag = match name.as_ref() {
                "url"                => Recording::URL,
                "query"              => Recording::QUERY,
                "body"               => Recording::BODY,
                "header" | "headers" => Recording::HEADER,
                other => {
                    tracing::warn!(name = other, "unknown recording flag ignored");
                    Recording::NONE
                }
            };
            acc | flag
        })
    }
}

impl BitOr for Recording {
    type Output = Recording;
    fn bitor(self, rhs: Recording) -> Recording {
        Recording(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Re-raise a captured panic after recording it.
    pub repanic:          bool,
    /// Record requests that matched no route, using the raw path as endpoint.
    pub record_unmatched: bool,
    /// Request parts copied into tags.
    pub recording:        Recording,
    /// Tags attached to every record (server name, version, ...).
    pub default_tags:     Tags,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            repanic:          true,
            record_unmatched: false,
            recording:        Recording::NONE,
            default_tags:     Tags::new(),
        }
    }
}

/// Incoming request metadata, as seen by whatever server wraps the handler.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method:     String,
    /// Matched route pattern; None when no route matched.
    pub route:      Option<String>,
    pub path:       String,
    pub client_ip:  Option<String>,
    pub user_agent: Option<String>,
    pub query:      BTreeMap<String, Vec<String>>,
    pub headers:    BTreeMap<String, Vec<String>>,
    /// Raw `Content-Type`, parameters included.
    pub content_type: Option<String>,
    pub body:       Option<Vec<u8>>,
}

impl RequestInfo {
    pub fn new(method: &str, route: Option<&str>, path: &str) -> Self {
        Self {
            method: method.to_string(),
            route:  route.map(str::to_string),
            path:   path.to_string(),
            ..Self::default()
        }
    }

    fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map_or(false, |mime| mime.trim().eq_ignore_ascii_case("application/json"))
    }
}

struct PanicSite {
    location:  String,
    backtrace: Backtrace,
}

thread_local! {
    static IN_HANDLER: Cell<bool> = Cell::new(false);
    static PANIC_SITE: RefCell<Option<PanicSite>> = RefCell::new(None);
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook in front of the current one that remembers where an
/// instrumented handler panicked. The previous hook still runs.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_HANDLER.with(Cell::get) {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                    .unwrap_or_else(|| "<unknown>".to_string());
                let site = PanicSite { location, backtrace: Backtrace::force_capture() };
                PANIC_SITE.with(|s| *s.borrow_mut() = Some(site));
            }
            previous(info);
        }));
    });
}

/// Marks the current thread as running a handler; restores the old flag on drop.
struct HandlerGuard(bool);

impl HandlerGuard {
    fn enter() -> Self {
        PANIC_SITE.with(|s| s.borrow_mut().take());
        HandlerGuard(IN_HANDLER.with(|f| f.replace(true)))
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        IN_HANDLER.with(|f| f.set(self.0));
    }
}

/// What a handler produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status_code: u16,
    pub body_size:   u64,
}

impl Response {
    pub fn ok(body_size: u64) -> Self {
        Self { status_code: 200, body_size }
    }
}

/// Per-invocation tag scope handed to the handler.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    tags: Tags,
}

impl Scope {
    pub fn set_tag(&mut self, key: &str, value: impl Into<String>) {
        self.tags.insert(key.to_string(), value.into());
    }

    /// Store `value` serialized as JSON. Silently skipped if it fails to serialize.
    pub fn set_tag_json<V: Serialize>(&mut self, key: &str, value: &V) {
        if let Ok(json) = serde_json::to_string(value) {
            self.tags.insert(key.to_string(), json);
        }
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }
}

/// Records transactions, exceptions and metrics into a shared ring.
#[derive(Clone)]
pub struct Capture {
    buffer:  SharedRing<Envelope>,
    options: CaptureOptions,
}

impl Capture {
    pub fn new(buffer: SharedRing<Envelope>, options: CaptureOptions) -> Self {
        install_panic_hook();
        Self { buffer, options }
    }

    pub fn buffer(&self) -> &SharedRing<Envelope> {
        &self.buffer
    }

    /// Run `handler`, timing it and catching panics, then record a transaction
    /// (plus an exception if it panicked).
    ///
    /// Returns `None` when the handler panicked and `repanic` is off; the
    /// transaction is then recorded with status 500. With `repanic` on, the
    /// panic resumes after both records are pushed.
    pub fn instrument<F>(&self, req: &RequestInfo, handler: F) -> Option<Response>
    where
        F: FnOnce(&mut Scope) -> Response,
    {
        let endpoint = match (&req.route, self.options.record_unmatched) {
            (Some(route), _) => format!("{} {}", req.method, route),
            (None, true)     => format!("{} {}", req.method, req.path),
            (None, false)    => {
                let mut scope = Scope::default();
                return Some(handler(&mut scope));
            }
        };

        let mut scope = Scope { tags: self.options.default_tags.clone() };
        let started_at = Utc::now();
        let start = Instant::now();
        let result = {
            let _guard = HandlerGuard::enter();
            panic::catch_unwind(AssertUnwindSafe(|| handler(&mut scope)))
        };
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record_request(req, &mut scope);

        let (response, payload) = match result {
            Ok(resp)     => (Some(resp), None),
            Err(payload) => (None, Some(payload)),
        };
        let status = response.map_or(500, |r| r.status_code);

        let txn = TransactionRecord {
            id: Uuid::new_v4(),
            endpoint,
            started_at,
            duration_ms,
            status_code: status,
            body_size: response.map_or(0, |r| r.body_size),
            client_ip: req.client_ip.clone(),
            tags: scope.tags.clone(),
        };
        let txn_id = txn.id;
        tracing::debug!(endpoint = %txn.endpoint, status, duration_ms, "transaction captured");
        self.push(Record::Transaction(txn));

        let payload = match payload {
            Some(p) => p,
            None    => return response,
        };

        let mut tags = scope.tags;
        if let Some(ua) = &req.user_agent {
            tags.insert("user_agent".into(), ua.clone());
        }
        let site = PANIC_SITE.with(|s| s.borrow_mut().take());
        let trace = format_panic(payload.as_ref(), site);
        tracing::warn!(%txn_id, "handler panicked");
        self.push(Record::Exception(ExceptionRecord {
            transaction_id: Some(txn_id),
            stack_trace:    trace,
            recorded_at:    Utc::now(),
            tags,
        }));

        if self.options.repanic {
            panic::resume_unwind(payload);
        }
        None
    }

    pub fn metric(&self, name: &str, value: f64) {
        self.push(Record::Metric(MetricRecord {
            name: name.to_string(),
            value,
            recorded_at: Utc::now(),
            tags: self.options.default_tags.clone(),
        }));
    }

    /// Record an error that is not tied to any transaction.
    pub fn exception(&self, message: &str) {
        self.push(Record::Exception(ExceptionRecord {
            transaction_id: None,
            stack_trace:    format!("{}\n{}", message, Backtrace::force_capture()),
            recorded_at:    Utc::now(),
            tags:           self.options.default_tags.clone(),
        }));
    }

    fn record_request(&self, req: &RequestInfo, scope: &mut Scope) {
        let rec = self.options.recording;
        if rec.contains(Recording::URL) {
            scope.set_tag("url", req.path.clone());
        }
        if rec.contains(Recording::QUERY) {
            scope.set_tag_json("query params", &req.query);
        }
        if rec.contains(Recording::BODY) && req.is_json() {
            if let Some(body) = &req.body {
                let end = body.len().min(BODY_LIMIT_FOR_REPORTING);
                scope.set_tag_json("body", &String::from_utf8_lossy(&body[..end]));
            }
        }
        if rec.contains(Recording::HEADER) {
            scope.set_tag_json("headers", &req.headers);
        }
    }

    fn push(&self, record: Record) {
        lock(&self.buffer).push(Envelope::new(record));
    }
}

fn format_panic(payload: &(dyn Any + Send), site: Option<PanicSite>) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    };
    match site {
        Some(site) => format!("panic: {}\n  at {}\n{}", msg, site.location, site.backtrace),
        // Hook was replaced by someone else; fall back to the catch site.
        None       => format!("panic: {}\n{}", msg, Backtrace::force_capture()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(cap: usize, repanic: bool) -> Capture {
        let ring = shared(RingBuffer::new(cap).unwrap());
        let opts = CaptureOptions { repanic, ..CaptureOptions::default() };
        Capture::new(ring, opts)
    }

    fn records(c: &Capture) -> Vec<Record> {
        lock(c.buffer()).read_all().into_iter().map(|e| e.record).collect()
    }

    #[test]
    fn records_matched_route() {
        let c = capture(8, true);
        let mut req = RequestInfo::new("GET", Some("/users/:id"), "/users/7");
        req.client_ip = Some("10.0.0.1".into());
        let resp = c.instrument(&req, |scope| {
            scope.set_tag("user", "7");
            Response::ok(12)
        });
        assert_eq!(resp, Some(Response::ok(12)));

        let recs = records(&c);
        assert_eq!(recs.len(), 1);
        match &recs[0] {
            Record::Transaction(t) => {
                assert_eq!(t.endpoint, "GET /users/:id");
                assert_eq!(t.status_code, 200);
                assert_eq!(t.body_size, 12);
                assert_eq!(t.client_ip.as_deref(), Some("10.0.0.1"));
                assert_eq!(t.tags.get("user").map(String::as_str), Some("7"));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn unmatched_route_skipped_unless_enabled() {
        let c = capture(8, true);
        let req = RequestInfo::new("GET", None, "/nope");
        assert_eq!(c.instrument(&req, |_| Response::ok(0)), Some(Response::ok(0)));
        assert!(records(&c).is_empty());

        let ring = shared(RingBuffer::new(8).unwrap());
        let c = Capture::new(ring, CaptureOptions { record_unmatched: true, ..CaptureOptions::default() });
        c.instrument(&req, |_| Response { status_code: 404, body_size: 0 });
        match &records(&c)[0] {
            Record::Transaction(t) => assert_eq!(t.endpoint, "GET /nope"),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn swallowed_panic_records_500_and_exception() {
        let c = capture(8, false);
        let mut req = RequestInfo::new("POST", Some("/boom"), "/boom");
        req.user_agent = Some("curl/8".into());
        let resp = c.instrument(&req, |_| -> Response { panic!("kaboom") });
        assert_eq!(resp, None);

        let recs = records(&c);
        assert_eq!(recs.len(), 2);
        let txn_id = match &recs[0] {
            Record::Transaction(t) => { assert_eq!(t.status_code, 500); t.id }
            other => panic!("unexpected record {:?}", other),
        };
        match &recs[1] {
            Record::Exception(e) => {
                assert_eq!(e.transaction_id, Some(txn_id));
                assert!(e.stack_trace.starts_with("panic: kaboom"));
                assert_eq!(e.tags.get("user_agent").map(String::as_str), Some("curl/8"));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn repanic_still_records() {
        let c = capture(8, true);
        let req = RequestInfo::new("GET", Some("/x"), "/x");
        let c2 = c.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            c2.instrument(&req, |_| -> Response { panic!("again") })
        }));
        assert!(outcome.is_err());
        assert_eq!(records(&c).len(), 2);
    }

    #[test]
    fn metrics_respect_capacity() {
        let c = capture(2, true);
        c.metric("cpu", 1.0);
        c.metric("cpu", 2.0);
        c.metric("cpu", 3.0);
        let values: Vec<f64> = records(&c).into_iter().filter_map(|r| match r {
            Record::Metric(m) => Some(m.value),
            _ => None,
        }).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[test]
    fn standalone_exception_has_no_transaction() {
        let c = capture(4, true);
        c.exception("disk full");
        match &records(&c)[0] {
            Record::Exception(e) => {
                assert_eq!(e.transaction_id, None);
                assert!(e.stack_trace.starts_with("disk full\n"));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    thread_local! {
        static PANIC_LINE: Cell<u32> = Cell::new(0);
    }

    fn failing_lookup_handler() -> Response {
        PANIC_LINE.with(|l| l.set(line!() + 1));
        panic!("lookup failed")
    }

    #[test]
    fn exception_trace_points_at_panic_site() {
        let c = capture(4, false);
        let req = RequestInfo::new("GET", Some("/lookup"), "/lookup");
        c.instrument(&req, |_| failing_lookup_handler());

        let expected = format!("{}:{}:", file!(), PANIC_LINE.with(Cell::get));
        match &records(&c)[1] {
            Record::Exception(e) => {
                assert!(e.stack_trace.starts_with("panic: lookup failed\n  at "));
                assert!(e.stack_trace.contains(&expected), "missing {} in {}", expected, e.stack_trace);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    fn recorded_tags(recording: Recording, req: &RequestInfo) -> Tags {
        let ring = shared(RingBuffer::new(4).unwrap());
        let c = Capture::new(ring, CaptureOptions { recording, ..CaptureOptions::default() });
        c.instrument(req, |_| Response::ok(0));
        match records(&c).remove(0) {
            Record::Transaction(t) => t.tags,
            other => panic!("unexpected record {:?}", other),
        }
    }

    fn full_request() -> RequestInfo {
        let mut req = RequestInfo::new("POST", Some("/orders"), "/orders");
        req.query.insert("page".into(), vec!["2".into()]);
        req.headers.insert("Accept".into(), vec!["application/json".into()]);
        req.content_type = Some("application/json; charset=utf-8".into());
        req.body = Some(br#"{"sku":"A1"}"#.to_vec());
        req
    }

    #[test]
    fn no_recording_flags_adds_no_request_tags() {
        assert!(recorded_tags(Recording::NONE, &full_request()).is_empty());
    }

    #[test]
    fn url_flag_tags_path() {
        let tags = recorded_tags(Recording::URL, &full_request());
        assert_eq!(tags.get("url").map(String::as_str), Some("/orders"));
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn query_flag_tags_params_as_json() {
        let tags = recorded_tags(Recording::QUERY, &full_request());
        assert_eq!(tags.get("query params").map(String::as_str), Some(r#"{"page":["2"]}"#));
    }

    #[test]
    fn header_flag_tags_headers_as_json() {
        let tags = recorded_tags(Recording::HEADER, &full_request());
        assert_eq!(tags.get("headers").map(String::as_str), Some(r#"{"Accept":["application/json"]}"#));
    }

    #[test]
    fn body_flag_only_for_json_bodies() {
        let tags = recorded_tags(Recording::BODY, &full_request());
        assert_eq!(tags.get("body").map(String::as_str), Some(r#""{\"sku\":\"A1\"}""#));

        let mut form = full_request();
        form.content_type = Some("application/x-www-form-urlencoded".into());
        assert!(recorded_tags(Recording::BODY, &form).get("body").is_none());
    }

    #[test]
    fn body_tag_is_capped() {
        let mut req = full_request();
        req.body = Some(vec![b'a'; BODY_LIMIT_FOR_REPORTING + 100]);
        let tags = recorded_tags(Recording::BODY, &req);
        let body: String = serde_json::from_str(&tags["body"]).unwrap();
        assert_eq!(body.len(), BODY_LIMIT_FOR_REPORTING);
    }

    #[test]
    fn recording_names_combine() {
        let rec = Recording::from_names(&["url", "headers", "bogus"]);
        assert!(rec.contains(Recording::URL));
        assert!(rec.contains(Recording::HEADER));
        assert!(!rec.contains(Recording::BODY));
        assert_eq!(rec, Recording::URL | Recording::HEADER);
    }

    #[test]
    fn json_tags_are_serialized() {
        let mut scope = Scope::default();
        scope.set_tag_json("query", &vec![("a", "1")]);
        assert_eq!(scope.tags().get("query").map(String::as_str), Some(r#"[["a","1"]]"#));
    }
}
