use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub type Tags = BTreeMap<String, String>;

/// One handled request / handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id:          Uuid,
    pub endpoint:    String,   // "GET /users/:id"
    pub started_at:  DateTime<Utc>,
    pub duration_ms: f64,
    pub status_code: u16,
    pub body_size:   u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip:   Option<String>,
    #[serde(default)]
    pub tags:        Tags,
}

/// A captured panic or reported error, optionally tied to a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    pub stack_trace:    String,
    pub recorded_at:    DateTime<Utc>,
    #[serde(default)]
    pub tags:           Tags,
}

/// A single host metric sample (cpu %, memory bytes, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name:        String,
    pub value:       f64,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub tags:        Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Transaction(TransactionRecord),
    Exception(ExceptionRecord),
    Metric(MetricRecord),
}

impl Record {
    pub fn label(&self) -> &'static str {
        match self {
            Record::Transaction(_) => "TXN",
            Record::Exception(_)   => "EXC",
            Record::Metric(_)      => "MET",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Transaction(t) => t.started_at,
            Record::Exception(e)   => e.recorded_at,
            Record::Metric(m)      => m.recorded_at,
        }
    }

    /// One-line human summary used by `--spool` output.
    pub fn summary(&self) -> String {
        match self {
            Record::Transaction(t) => format!(
                "{} {} {:.1}ms {}B",
                t.endpoint, t.status_code, t.duration_ms, t.body_size
            ),
            Record::Exception(e) => e.stack_trace.lines().next().unwrap_or("").to_string(),
            Record::Metric(m)    => format!("{} = {:.2}", m.name, m.value),
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The unit stored in the ring. `id` is unique per process and is the ack key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id:     u64,
    #[serde(flatten)]
    pub record: Record,
}

impl Envelope {
    pub fn new(record: Record) -> Self {
        Self { id: NEXT_ID.fetch_add(1, Ordering::Relaxed), record }
    }
}
