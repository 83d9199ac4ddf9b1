//! Persistent shell sessions multiplexed over replaceable client transports.

mod handoff;
mod liveness;
mod manager;
mod pty;
mod router;
mod session;
mod target;
mod transport;

pub use handoff::{serve_connection, ServeError};
pub use manager::SessionManager;
pub use router::{CommandRouter, CommandSource, ShellCommand, StaticResolver};
pub use session::{Session, SessionInfo, SessionState};
pub use target::Target;
pub use transport::{Inbound, Outbound, Transport};
