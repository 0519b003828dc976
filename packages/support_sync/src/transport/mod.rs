//! Real-time transport: wire protocol, reconnect schedule, and the
//! connection actor.

mod backoff;
mod connection;
pub mod protocol;

pub use backoff::Backoff;
pub use connection::{ConnectionState, TransportConnection, TransportControl, TransportHandle};
pub use protocol::{ClientEvent, TransportEvent};
