pub mod pattern;
pub mod snapshot;
pub mod status;
pub mod wire;

pub use pattern::EventPattern;
pub use snapshot::{NodeIndex, NodeListSnapshot, RequestId};
pub use status::{Status, StatusWord};
