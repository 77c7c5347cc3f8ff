pub mod connections;
pub mod inbox;
pub mod log_sink;
pub mod observers;
pub mod registry;
pub mod relay;
pub mod transport;

pub use connections::{Address, ConnectionState, ConnectionTracker, ServerConnection};
pub use inbox::{channel, InboxSender, RelayInbox, WaitError, WaitTimeout};
pub use log_sink::{LogRecord, LogSink, MemoryLogSink, TracingLogSink};
pub use observers::{SubscriptionHandle, SubscriptionId};
pub use registry::{Node, NodeRegistry, RegistryConfig};
pub use relay::{EventRelay, NodeChange, NodeFilter, RelayConfig, RelayError, RelayEvent};
pub use transport::{RecordingTransport, Transport, TransportError};
