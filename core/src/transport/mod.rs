/// Server transport: wire protocol, connection and session binding
pub mod binder;
pub mod channel;
pub mod protocol;

pub use binder::bind;
pub use channel::{ConnectionState, TransportChannel};
pub use protocol::{Command, Frame};
