use crate::connections::{
    Address, AttachmentChange, ConnectionError, ConnectionMetadata, ConnectionState,
    ConnectionTracker, ServerConnection,
};
use crate::log_sink::{LogRecord, LogSink, TracingLogSink};
use crate::observers::{DeliveryFailure, SubscriberList, SubscriptionHandle};
use crate::registry::{Node, NodeRegistry, RegistryConfig, RequestIdUpdate};
use crate::transport::{Transport, TransportError};
use meq_core::pattern::strip_segment_prefix;
use meq_core::snapshot::{MalformedSnapshotError, NodeListSnapshot};
use meq_core::status::{self, BreakpointTarget, Status, StatusWord};
use meq_core::{EventPattern, NodeIndex, RequestId};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONNECTION_EVENT_PREFIX: &str = "Relay.Connection";
const PAYLOAD_SUMMARY_CHARS: usize = 160;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Routing prefix stripped from inbound event ids.
    pub event_prefix: String,
    /// Prefix for outbound request ids.
    pub request_prefix: String,
    /// Logical names that carry a single node's status.
    pub node_event_patterns: Vec<String>,
    pub snapshot_event: String,
    pub clear_event: String,
    pub hello_event: String,
    pub bye_event: String,
    pub remote_down_event: String,
    pub registry: RegistryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            event_prefix: "App.Out".to_string(),
            request_prefix: "App.In".to_string(),
            node_event_patterns: vec!["Node.Status.*".to_string(), "Node.Result.*".to_string()],
            snapshot_event: "Node.List".to_string(),
            clear_event: "Forest.Cleared".to_string(),
            hello_event: "Hello".to_string(),
            bye_event: "Bye".to_string(),
            remote_down_event: "Remote.Down".to_string(),
            registry: RegistryConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Snapshot(#[from] MalformedSnapshotError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What pattern subscribers receive.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    /// Full event id as delivered.
    pub id: String,
    /// `id` with the routing prefix removed.
    pub name: String,
    pub payload: Value,
    pub source: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFilter {
    All,
    Index(NodeIndex),
}

impl NodeFilter {
    fn admits(&self, index: NodeIndex) -> bool {
        match self {
            Self::All => true,
            Self::Index(wanted) => *wanted == index,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::All => "node:*".to_string(),
            Self::Index(index) => format!("node:{index}"),
        }
    }
}

/// One node status transition, sent to node subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeChange {
    pub node: Node,
    pub old: Status,
    pub new: Status,
    pub source: Address,
}

/// Fields a node status event may carry. Absent fields leave the node as is.
#[derive(Debug, Default, PartialEq)]
struct NodeStatePayload {
    index: Option<NodeIndex>,
    name: Option<String>,
    control_status: Option<StatusWord>,
    request_id: RequestIdUpdate,
    profiling_stats: Option<Vec<f64>>,
    cache_stats: Option<Vec<f64>>,
}

impl NodeStatePayload {
    fn from_value(payload: &Value) -> Self {
        let Some(record) = payload.as_object() else {
            return Self::default();
        };
        let request_id = match record.get("request_id") {
            None => RequestIdUpdate::Unchanged,
            Some(Value::Null) => RequestIdUpdate::Set(None),
            Some(value) => RequestIdUpdate::Set(RequestId::from_value(value)),
        };
        Self {
            index: record
                .get("nodeindex")
                .and_then(Value::as_i64)
                .map(NodeIndex),
            name: record
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            control_status: record
                .get("control_status")
                .and_then(Value::as_u64)
                .and_then(|word| u32::try_from(word).ok())
                .map(StatusWord),
            request_id,
            profiling_stats: numbers(record.get("profiling_stats")),
            cache_stats: numbers(record.get("cache_stats")),
        }
    }
}

fn numbers(value: Option<&Value>) -> Option<Vec<f64>> {
    value?.as_array()?.iter().map(Value::as_f64).collect()
}

/// Single dispatch point between the transport and everything that watches
/// the kernel.
///
/// Owns the node registry and the connection tracker. Not thread-safe: other
/// threads hand messages over through [`crate::inbox::InboxSender`].
pub struct EventRelay {
    config: RelayConfig,
    node_patterns: Vec<EventPattern>,
    registry: NodeRegistry,
    connections: ConnectionTracker,
    subscribers: SubscriberList<EventPattern, RelayEvent>,
    node_subscribers: SubscriberList<NodeFilter, NodeChange>,
    log_sink: Box<dyn LogSink>,
    transport: Box<dyn Transport>,
    delivered: u64,
}

impl EventRelay {
    pub fn new(config: RelayConfig, transport: Box<dyn Transport>) -> Self {
        let node_patterns = config
            .node_event_patterns
            .iter()
            .map(|pattern| EventPattern::new(pattern))
            .collect();
        let registry = NodeRegistry::new(config.registry.clone());
        Self {
            config,
            node_patterns,
            registry,
            connections: ConnectionTracker::new(),
            subscribers: SubscriberList::new(),
            node_subscribers: SubscriberList::new(),
            log_sink: Box::new(TracingLogSink),
            transport,
            delivered: 0,
        }
    }

    pub fn set_log_sink(&mut self, sink: Box<dyn LogSink>) {
        self.log_sink = sink;
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Subscribes to every event whose full id matches `pattern`.
    pub fn subscribe<F>(&self, pattern: impl Into<EventPattern>, callback: F) -> SubscriptionHandle
    where
        F: FnMut(&RelayEvent) -> anyhow::Result<()> + 'static,
    {
        self.subscribers.subscribe(pattern.into(), callback)
    }

    pub fn subscribe_nodes<F>(&self, filter: NodeFilter, callback: F) -> SubscriptionHandle
    where
        F: FnMut(&NodeChange) -> anyhow::Result<()> + 'static,
    {
        self.node_subscribers.subscribe(filter, callback)
    }

    /// Safe to call from inside a running callback.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        handle.cancel()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len() + self.node_subscribers.len()
    }

    /// Routes one inbound message. Registry and connection updates are applied
    /// before any subscriber runs. A malformed node list is returned as an
    /// error and nothing is dispatched for it.
    pub fn deliver(
        &mut self,
        event_id: &str,
        payload: Value,
        source: &Address,
    ) -> Result<(), RelayError> {
        self.delivered += 1;
        let name = strip_segment_prefix(event_id, &self.config.event_prefix)
            .unwrap_or(event_id)
            .to_string();
        let is_hello = same_name(&name, &self.config.hello_event);
        let is_bye = same_name(&name, &self.config.bye_event);
        let is_remote_down = same_name(&name, &self.config.remote_down_event);

        if !is_hello && !is_bye && !is_remote_down {
            self.connections.adopt(source);
        }

        if let Some(record) = LogRecord::from_payload(&name, source, &payload) {
            self.log_sink.record(record);
        }

        let mut greeted = None;
        let mut removed = Vec::new();
        if is_hello {
            let first = self
                .connections
                .get(source)
                .map_or(true, |connection| connection.state == ConnectionState::Unknown);
            let metadata = ConnectionMetadata::from_payload(&payload).unwrap_or_default();
            let connection = self.connections.on_hello(source, &metadata);
            if first {
                greeted = Some(connection.clone());
            }
        } else if is_bye {
            removed.extend(self.connections.on_bye(source));
        } else if is_remote_down {
            let prefix = payload
                .get("gateway")
                .or_else(|| payload.get("prefix"))
                .and_then(Value::as_str)
                .unwrap_or(source.as_str())
                .to_string();
            removed.extend(self.connections.on_remote_down(&prefix));
        } else if let Some(metadata) = ConnectionMetadata::from_payload(&payload) {
            self.connections.apply_metadata(source, &metadata);
        }

        if same_name(&name, &self.config.snapshot_event) {
            self.ingest_snapshot(&payload)?;
        } else if same_name(&name, &self.config.clear_event) {
            self.registry.clear();
        } else if self.node_patterns.iter().any(|pattern| pattern.matches(&name)) {
            self.ingest_node_state(&name, &payload, source);
        }

        let event = RelayEvent {
            id: event_id.to_string(),
            name,
            payload,
            source: source.clone(),
        };
        self.publish(&event);

        if let Some(connection) = &greeted {
            self.publish_connection_event("Hello", connection);
        }
        for connection in &removed {
            let suffix = if is_bye { "Bye" } else { "Down" };
            self.publish_connection_event(suffix, connection);
        }
        self.flush_attachment_changes();
        Ok(())
    }

    fn ingest_snapshot(&mut self, payload: &Value) -> Result<(), RelayError> {
        let snapshot = NodeListSnapshot::from_value(payload)?;
        if snapshot.is_unchanged_reply() {
            if snapshot.serial == Some(self.registry.serial()) {
                debug!(event = "relay_snapshot_unchanged", serial = self.registry.serial());
            } else if let Some(serial) = snapshot.serial {
                warn!(
                    event = "relay_snapshot_empty",
                    serial,
                    current = self.registry.serial()
                );
            }
            return Ok(());
        }
        self.registry.load_snapshot(snapshot)?;
        Ok(())
    }

    fn ingest_node_state(&mut self, name: &str, payload: &Value, source: &Address) {
        let update = NodeStatePayload::from_value(payload);
        let index = update.index.or_else(|| {
            update
                .name
                .as_deref()
                .and_then(|node_name| self.registry.find_by_name(node_name))
                .map(|node| node.index)
        });
        let Some(index) = index else {
            warn!(
                event = "relay_node_event_unresolved",
                name,
                payload = %summarize(payload)
            );
            return;
        };

        let word = update.control_status.unwrap_or_else(|| {
            self.registry
                .find_by_index(index)
                .map(|node| node.status_word)
                .unwrap_or_default()
        });
        let previous = self
            .registry
            .apply_status_update(index, word, update.request_id);
        self.registry
            .set_stats(index, update.profiling_stats, update.cache_stats);

        let Some(node) = self.registry.find_by_index(index) else {
            return;
        };
        let change = NodeChange {
            node: node.clone(),
            old: status::decode(previous),
            new: status::decode(word),
            source: source.clone(),
        };
        let failures = self.node_subscribers.dispatch(
            &change,
            |filter| filter.admits(index),
            NodeFilter::describe,
        );
        report_failures(name, payload, &failures);
    }

    fn publish(&self, event: &RelayEvent) {
        let failures = self.subscribers.dispatch(
            event,
            |pattern| pattern.matches(&event.id),
            |pattern| pattern.as_str().to_string(),
        );
        report_failures(&event.id, &event.payload, &failures);
    }

    fn publish_connection_event(&self, kind: &str, connection: &ServerConnection) {
        let payload = serde_json::to_value(connection)
            .unwrap_or_else(|_| json!({ "address": connection.address.as_str() }));
        self.publish(&RelayEvent {
            id: format!("{CONNECTION_EVENT_PREFIX}.{kind}"),
            name: format!("Connection.{kind}"),
            payload,
            source: connection.address.clone(),
        });
    }

    fn flush_attachment_changes(&mut self) {
        for change in self.connections.drain_changes() {
            let (kind, address) = match change {
                AttachmentChange::Attached(address) => ("Attached", address),
                AttachmentChange::Detached(address) => ("Detached", address),
            };
            self.publish(&RelayEvent {
                id: format!("{CONNECTION_EVENT_PREFIX}.{kind}"),
                name: format!("Connection.{kind}"),
                payload: json!({ "address": address.as_str() }),
                source: address,
            });
        }
    }

    pub fn attach(&mut self, address: &Address) -> Result<(), RelayError> {
        let attached = self.connections.attach(address);
        self.flush_attachment_changes();
        Ok(attached?)
    }

    pub fn detach(&mut self) {
        self.connections.detach_current();
        self.flush_attachment_changes();
    }

    pub fn auto_attach_rule(&mut self, pid: Option<i64>, host: Option<String>) {
        self.connections.auto_attach_rule(pid, host);
    }

    /// Asks the attached server for its node list. The answer arrives later as
    /// a node-list event; a server with nothing new replies with the serial only.
    pub fn request_node_list(&mut self) -> Result<(), RelayError> {
        let serial = self.registry.serial();
        self.send_to_current("Node.Get.List", json!({ "serial": serial }))
    }

    pub fn request_node_state(&mut self, index: NodeIndex) -> Result<(), RelayError> {
        self.send_to_current("Node.Get.State", json!({ "nodeindex": index.0 }))
    }

    pub fn set_breakpoint(
        &mut self,
        index: NodeIndex,
        target: BreakpointTarget,
        single_shot: bool,
    ) -> Result<(), RelayError> {
        self.send_to_current(
            "Node.Set.Breakpoint",
            json!({
                "nodeindex": index.0,
                "breakpoint": status::breakpoint_mask_for_phase(target),
                "single_shot": single_shot,
            }),
        )
    }

    pub fn clear_breakpoint(
        &mut self,
        index: NodeIndex,
        target: BreakpointTarget,
    ) -> Result<(), RelayError> {
        self.send_to_current(
            "Node.Clear.Breakpoint",
            json!({
                "nodeindex": index.0,
                "breakpoint": status::breakpoint_mask_for_phase(target),
            }),
        )
    }

    fn send_to_current(&mut self, command: &str, payload: Value) -> Result<(), RelayError> {
        let destination = self
            .connections
            .current_address()
            .cloned()
            .ok_or(ConnectionError::NotAttached)?;
        let event_id = format!("{}.{command}", self.config.request_prefix);
        info!(
            event = "relay_request",
            request = %event_id,
            destination = %destination
        );
        self.transport.send(&event_id, payload, &destination)?;
        Ok(())
    }
}

fn same_name(name: &str, configured: &str) -> bool {
    name.eq_ignore_ascii_case(configured)
}

fn report_failures(event_id: &str, payload: &Value, failures: &[DeliveryFailure]) {
    for failure in failures {
        warn!(
            event = "relay_subscriber_failed",
            event_id,
            subscriber = %failure.subscriber,
            key = %failure.key,
            payload = %summarize(payload),
            error = %failure.error
        );
    }
}

fn summarize(payload: &Value) -> String {
    let rendered = payload.to_string();
    if rendered.chars().count() <= PAYLOAD_SUMMARY_CHARS {
        return rendered;
    }
    let mut summary = rendered
        .chars()
        .take(PAYLOAD_SUMMARY_CHARS)
        .collect::<String>();
    summary.push_str("...");
    summary
}
