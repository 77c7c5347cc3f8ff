//! Hand-off queue from transport threads to the relay's home thread, and the
//! bounded wait loops built on it.

use crate::connections::Address;
use crate::relay::{EventRelay, RelayError};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Longest single sleep inside a wait loop.
pub const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub event_id: String,
    pub payload: Value,
    pub source: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    After(Duration),
    Forever,
}

impl WaitTimeout {
    pub fn from_secs_f64(seconds: f64) -> Self {
        Duration::try_from_secs_f64(seconds.max(0.0)).map_or(Self::Forever, Self::After)
    }
}

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::After(duration) => write!(f, "{:.1}s", duration.as_secs_f64()),
            Self::Forever => f.write_str("forever"),
        }
    }
}

impl FromStr for WaitTimeout {
    type Err = String;

    /// Accepts `forever` or a number of seconds.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("forever") {
            return Ok(Self::Forever);
        }
        let seconds = raw
            .parse::<f64>()
            .map_err(|_| format!("expected seconds or 'forever', got '{raw}'"))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("timeout must be a non-negative number, got '{raw}'"));
        }
        Ok(Self::from_secs_f64(seconds))
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("no connection within {waited:?}")]
    ConnectionTimeout { waited: Duration },
    #[error("condition not met within {waited:?}")]
    Timeout { waited: Duration },
    #[error("inbox closed")]
    InboxClosed,
}

/// Sending half. Cheap to clone and safe to move to other threads.
#[derive(Debug, Clone)]
pub struct InboxSender {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl InboxSender {
    /// Returns false once the receiving relay is gone.
    pub fn post(&self, event_id: impl Into<String>, payload: Value, source: Address) -> bool {
        self.tx
            .send(InboundMessage {
                event_id: event_id.into(),
                payload,
                source,
            })
            .is_ok()
    }
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub delivered: usize,
    pub errors: Vec<RelayError>,
}

pub struct RelayInbox {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    closed: bool,
}

pub fn channel() -> (InboxSender, RelayInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (InboxSender { tx }, RelayInbox { rx, closed: false })
}

impl RelayInbox {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Delivers everything already queued without waiting. A failed delivery
    /// is collected and the rest of the queue still goes through.
    pub fn drain(&mut self, relay: &mut EventRelay) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            match self.rx.try_recv() {
                Ok(message) => self.deliver(relay, message, &mut report),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        report
    }

    /// Waits up to `slice` for one message and delivers it. Returns false on
    /// an empty slice.
    pub async fn pump(
        &mut self,
        relay: &mut EventRelay,
        slice: Duration,
    ) -> Result<bool, WaitError> {
        if self.closed {
            return Err(WaitError::InboxClosed);
        }
        match timeout(slice, self.rx.recv()).await {
            Ok(Some(message)) => {
                let mut report = DrainReport::default();
                self.deliver(relay, message, &mut report);
                Ok(true)
            }
            Ok(None) => {
                self.closed = true;
                Err(WaitError::InboxClosed)
            }
            Err(_) => Ok(false),
        }
    }

    /// Drains the queue until `condition` holds or the deadline passes.
    pub async fn wait_until(
        &mut self,
        relay: &mut EventRelay,
        limit: WaitTimeout,
        mut condition: impl FnMut(&EventRelay) -> bool,
    ) -> Result<(), WaitError> {
        let started = Instant::now();
        let deadline = match limit {
            WaitTimeout::After(duration) => Some(started + duration),
            WaitTimeout::Forever => None,
        };
        loop {
            self.drain(relay);
            if condition(relay) {
                return Ok(());
            }
            if self.closed {
                return Err(WaitError::InboxClosed);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(WaitError::Timeout {
                            waited: started.elapsed(),
                        });
                    }
                    remaining.min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };
            self.pump(relay, slice).await?;
        }
    }

    /// Blocks until a server qualifies: the attached one when an auto-attach
    /// rule is pending, otherwise any known server.
    pub async fn wait_for_connection(
        &mut self,
        relay: &mut EventRelay,
        limit: WaitTimeout,
    ) -> Result<Address, WaitError> {
        let wants_attach = relay.connections().pending_auto_attach().is_some();
        let waited = self
            .wait_until(relay, limit, |relay| {
                qualifying_connection(relay, wants_attach).is_some()
            })
            .await;
        match waited {
            Ok(()) => qualifying_connection(relay, wants_attach).ok_or(WaitError::InboxClosed),
            Err(WaitError::Timeout { waited }) => {
                warn!(event = "inbox_connection_timeout", limit = %limit);
                Err(WaitError::ConnectionTimeout { waited })
            }
            Err(err) => Err(err),
        }
    }

    fn deliver(&self, relay: &mut EventRelay, message: InboundMessage, report: &mut DrainReport) {
        let InboundMessage {
            event_id,
            payload,
            source,
        } = message;
        match relay.deliver(&event_id, payload, &source) {
            Ok(()) => {
                report.delivered += 1;
                debug!(event = "inbox_delivered", event_id = %event_id, source = %source);
            }
            Err(err) => {
                warn!(
                    event = "inbox_delivery_failed",
                    event_id = %event_id,
                    source = %source,
                    error = %err
                );
                report.errors.push(err);
            }
        }
    }
}

fn qualifying_connection(relay: &EventRelay, wants_attach: bool) -> Option<Address> {
    let connections = relay.connections();
    if let Some(address) = connections.current_address() {
        return Some(address.clone());
    }
    if wants_attach {
        return None;
    }
    connections
        .iter()
        .next()
        .map(|connection| connection.address.clone())
}
