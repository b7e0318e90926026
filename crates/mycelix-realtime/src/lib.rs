mod event;
mod registry;

pub use event::{EmailSummary, RealtimeEvent};
pub use registry::{ConnectionRegistry, Subscription, CONNECTION_BUFFER};
