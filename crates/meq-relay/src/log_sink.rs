use crate::connections::Address;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::{error, info};

pub const DEFAULT_LOG_RING_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Error => "error",
        })
    }
}

/// A message the kernel attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub severity: Severity,
    pub text: String,
    pub event: String,
    pub source: Address,
    pub received_at: DateTime<Utc>,
}

impl LogRecord {
    /// Pulls `error`, `message` or `text` out of a payload record. `error`
    /// wins and marks the record as an error.
    pub fn from_payload(event: &str, source: &Address, payload: &Value) -> Option<Self> {
        let record = payload.as_object()?;
        let (severity, field) = if let Some(field) = record.get("error") {
            (Severity::Error, field)
        } else if let Some(field) = record.get("message") {
            (Severity::Info, field)
        } else {
            (Severity::Info, record.get("text")?)
        };
        let text = match field {
            Value::String(text) => text.clone(),
            Value::Null => return None,
            other => other.to_string(),
        };
        Some(Self {
            severity,
            text,
            event: event.to_string(),
            source: source.clone(),
            received_at: Utc::now(),
        })
    }
}

pub trait LogSink {
    fn record(&mut self, record: LogRecord);
}

/// Re-emits kernel messages as tracing events.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&mut self, record: LogRecord) {
        match record.severity {
            Severity::Error => error!(
                event = "kernel_error",
                source = %record.source,
                kernel_event = %record.event,
                text = %record.text
            ),
            Severity::Info => info!(
                event = "kernel_message",
                source = %record.source,
                kernel_event = %record.event,
                text = %record.text
            ),
        }
    }
}

/// Keeps the most recent records for readers on the relay's thread.
#[derive(Debug, Clone)]
pub struct MemoryLogSink {
    capacity: usize,
    records: Rc<RefCell<VecDeque<LogRecord>>>,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.borrow().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }
}

impl Default for MemoryLogSink {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_RING_CAPACITY)
    }
}

impl LogSink for MemoryLogSink {
    fn record(&mut self, record: LogRecord) {
        let mut records = self.records.borrow_mut();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }
}
