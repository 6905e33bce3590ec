pub mod bus;
pub mod envelope;
pub mod frame;
pub mod message;
pub mod reconciler;
pub mod runtime;

pub use bus::{BusError, Incoming, MessageBus, RequestOptions};
pub use envelope::{Envelope, EnvelopeCodec};
pub use reconciler::{Container, Element, Prop};
pub use runtime::{run_stdio, spawn_in_process, CommandContext, ContextChannels, Extension, RuntimeConfig};
