use crate::connections::Address;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound half of the message bus.
pub trait Transport {
    fn send(
        &mut self,
        event_id: &str,
        payload: Value,
        destination: &Address,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub event_id: String,
    pub payload: Value,
    pub destination: Address,
}

/// Keeps every outbound message; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Rc<RefCell<Vec<SentMessage>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.borrow().clone()
    }

    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }
}

impl Transport for RecordingTransport {
    fn send(
        &mut self,
        event_id: &str,
        payload: Value,
        destination: &Address,
    ) -> Result<(), TransportError> {
        self.sent.borrow_mut().push(SentMessage {
            event_id: event_id.to_string(),
            payload,
            destination: destination.clone(),
        });
        Ok(())
    }
}
