use meq_core::pattern::has_segment_prefix;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Routing address of a remote server. Segments are dot-separated, the
/// leading ones naming the gateway the server sits behind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_under(&self, prefix: &str) -> bool {
        has_segment_prefix(&self.0, prefix)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unknown,
    Connected,
    Running,
    Paused,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Disconnected => "disconnected",
        }
    }

    /// Maps a kernel `app_state` string onto the connection state machine.
    pub fn from_app_state(app_state: &str) -> Option<Self> {
        let normalized = app_state.trim().to_lowercase();
        match normalized.as_str() {
            "running" | "executing" | "busy" | "stream" | "streaming" => Some(Self::Running),
            "paused" | "stopped" | "debug" | "debugging" => Some(Self::Paused),
            "idle" | "connected" | "ready" | "init" => Some(Self::Connected),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive fields a server reports about itself. Every field is optional
/// and only present fields are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionMetadata {
    pub app_state: Option<Value>,
    pub app_state_string: Option<String>,
    pub app_host: Option<String>,
    pub host: Option<String>,
    pub pid: Option<i64>,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub cwd: Option<String>,
    pub process_status: Option<String>,
}

impl ConnectionMetadata {
    /// Reads the known fields out of a payload record, one at a time. A field
    /// of an unexpected type is skipped without affecting the others. Returns
    /// `None` when the payload is not a record or carries none of them.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let record = payload.as_object()?;
        let text = |key: &str| record.get(key).and_then(scalar_text);
        let metadata = Self {
            app_state: record.get("app_state").filter(|value| !value.is_null()).cloned(),
            app_state_string: text("app_state_string"),
            app_host: text("app_host"),
            host: text("host"),
            pid: record.get("pid").and_then(integer),
            session_id: text("session_id"),
            session_name: text("session_name"),
            cwd: text("cwd"),
            process_status: text("process_status"),
        };
        (metadata != Self::default()).then_some(metadata)
    }

    pub fn host(&self) -> Option<&str> {
        self.app_host.as_deref().or(self.host.as_deref())
    }

    pub fn requested_state(&self) -> Option<ConnectionState> {
        let label = self
            .app_state_string
            .as_deref()
            .or_else(|| self.app_state.as_ref().and_then(Value::as_str))?;
        ConnectionState::from_app_state(label)
    }
}

/// Strings pass through; numbers and booleans are rendered as text.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerConnection {
    pub address: Address,
    pub state: ConnectionState,
    pub process_status: Option<String>,
    pub app_state: Option<String>,
    pub host: Option<String>,
    pub pid: Option<i64>,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub cwd: Option<String>,
}

impl ServerConnection {
    fn new(address: Address, state: ConnectionState) -> Self {
        Self {
            address,
            state,
            process_status: None,
            app_state: None,
            host: None,
            pid: None,
            session_id: None,
            session_name: None,
            cwd: None,
        }
    }

    fn merge(&mut self, metadata: &ConnectionMetadata) {
        if let Some(host) = metadata.host() {
            self.host = Some(host.to_string());
        }
        if let Some(pid) = metadata.pid {
            self.pid = Some(pid);
        }
        if let Some(session_id) = &metadata.session_id {
            self.session_id = Some(session_id.clone());
        }
        if let Some(session_name) = &metadata.session_name {
            self.session_name = Some(session_name.clone());
        }
        if let Some(cwd) = &metadata.cwd {
            self.cwd = Some(cwd.clone());
        }
        if let Some(process_status) = &metadata.process_status {
            self.process_status = Some(process_status.clone());
        }
        if let Some(label) = &metadata.app_state_string {
            self.app_state = Some(label.clone());
        } else if let Some(Value::String(label)) = &metadata.app_state {
            self.app_state = Some(label.clone());
        }
        if let Some(state) = metadata.requested_state() {
            self.state = state;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentChange {
    Attached(Address),
    Detached(Address),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoAttachRule {
    pub pid: Option<i64>,
    pub host: Option<String>,
}

impl AutoAttachRule {
    fn matches(&self, connection: &ServerConnection) -> bool {
        let pid_ok = self.pid.map_or(true, |pid| connection.pid == Some(pid));
        let host_ok = self
            .host
            .as_deref()
            .map_or(true, |host| connection.host.as_deref() == Some(host));
        pid_ok && host_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("server {0} is not connected")]
    NotConnected(Address),
    #[error("no server attached")]
    NotAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// Known servers and the one the client is attached to.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: BTreeMap<Address, ServerConnection>,
    current: Option<Address>,
    auto_attach: Option<AutoAttachRule>,
    changes: Vec<AttachmentChange>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a server. A repeated hello returns the existing connection
    /// unchanged; the first hello for an adopted server fills it in.
    pub fn on_hello(
        &mut self,
        address: &Address,
        metadata: &ConnectionMetadata,
    ) -> &ServerConnection {
        let first = self
            .connections
            .get(address)
            .map_or(true, |existing| existing.state == ConnectionState::Unknown);
        if first {
            let connection = self
                .connections
                .entry(address.clone())
                .or_insert_with(|| {
                    ServerConnection::new(address.clone(), ConnectionState::Unknown)
                });
            connection.state = ConnectionState::Connected;
            connection.merge(metadata);
            info!(
                event = "connection_hello",
                address = %address,
                host = connection.host.as_deref().unwrap_or_default(),
                pid = connection.pid.unwrap_or_default()
            );
            self.try_auto_attach(address);
        } else {
            debug!(event = "connection_hello_repeat", address = %address);
        }
        &self.connections[address]
    }

    /// Registers a server seen before its hello.
    pub fn adopt(&mut self, address: &Address) -> bool {
        if self.connections.contains_key(address) {
            return false;
        }
        info!(event = "connection_adopted", address = %address);
        self.connections.insert(
            address.clone(),
            ServerConnection::new(address.clone(), ConnectionState::Unknown),
        );
        true
    }

    /// Applies a state notification to a known server.
    pub fn apply_metadata(
        &mut self,
        address: &Address,
        metadata: &ConnectionMetadata,
    ) -> Option<StateTransition> {
        let connection = self.connections.get_mut(address)?;
        let previous = connection.state;
        connection.merge(metadata);
        let current = connection.state;
        if previous != current {
            info!(
                event = "connection_state",
                address = %address,
                previous = %previous,
                current = %current
            );
        }
        self.try_auto_attach(address);
        Some(StateTransition { previous, current })
    }

    pub fn on_bye(&mut self, address: &Address) -> Option<ServerConnection> {
        let removed = self.remove(address);
        match &removed {
            Some(_) => info!(event = "connection_bye", address = %address),
            None => debug!(event = "connection_bye_unknown", address = %address),
        }
        removed
    }

    /// Drops every server behind the gateway named by `gateway_prefix`.
    pub fn on_remote_down(&mut self, gateway_prefix: &str) -> Vec<ServerConnection> {
        let doomed = self
            .connections
            .keys()
            .filter(|address| address.is_under(gateway_prefix))
            .cloned()
            .collect::<Vec<_>>();
        let removed = doomed
            .iter()
            .filter_map(|address| self.remove(address))
            .collect::<Vec<_>>();
        info!(
            event = "connection_remote_down",
            prefix = gateway_prefix,
            removed = removed.len()
        );
        removed
    }

    fn remove(&mut self, address: &Address) -> Option<ServerConnection> {
        let mut connection = self.connections.remove(address)?;
        connection.state = ConnectionState::Disconnected;
        if self.current.as_ref() == Some(address) {
            self.current = None;
            self.changes.push(AttachmentChange::Detached(address.clone()));
        }
        Some(connection)
    }

    pub fn attach(&mut self, address: &Address) -> Result<(), ConnectionError> {
        if !self.connections.contains_key(address) {
            return Err(ConnectionError::NotConnected(address.clone()));
        }
        if self.current.as_ref() == Some(address) {
            return Ok(());
        }
        self.detach_current();
        self.current = Some(address.clone());
        self.changes.push(AttachmentChange::Attached(address.clone()));
        info!(event = "connection_attached", address = %address);
        Ok(())
    }

    pub fn detach_current(&mut self) {
        if let Some(previous) = self.current.take() {
            info!(event = "connection_detached", address = %previous);
            self.changes.push(AttachmentChange::Detached(previous));
        }
    }

    /// Attach to the next server whose pid and host match. Fires once.
    pub fn auto_attach_rule(&mut self, pid: Option<i64>, host: Option<String>) {
        self.auto_attach = Some(AutoAttachRule { pid, host });
    }

    pub fn pending_auto_attach(&self) -> Option<&AutoAttachRule> {
        self.auto_attach.as_ref()
    }

    fn try_auto_attach(&mut self, address: &Address) {
        let matched = match (&self.auto_attach, self.connections.get(address)) {
            (Some(rule), Some(connection)) => rule.matches(connection),
            _ => false,
        };
        if matched {
            self.auto_attach = None;
            info!(event = "connection_auto_attach", address = %address);
            let _ = self.attach(address);
        }
    }

    /// Attach and detach notifications accumulated since the last call.
    pub fn drain_changes(&mut self) -> Vec<AttachmentChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn get(&self, address: &Address) -> Option<&ServerConnection> {
        self.connections.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.connections.contains_key(address)
    }

    pub fn current(&self) -> Option<&ServerConnection> {
        self.current
            .as_ref()
            .and_then(|address| self.connections.get(address))
    }

    pub fn current_address(&self) -> Option<&Address> {
        self.current.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerConnection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
