//! Stratum v1 server.
//!
//! The pool side of the line-delimited JSON-RPC mining protocol:
//!
//! - **Client requests**: subscribe, authorize, submit, suggest_difficulty,
//!   extranonce.subscribe
//! - **Server notifications**: mining.notify (new work),
//!   mining.set_difficulty
//!
//! [`StratumListener`] accepts sockets on one port and runs
//! [`serve_connection`] for each. A connection moves through
//! Connected → Subscribed → Authorized; only disconnect goes back.

mod connection;
mod context;
mod messages;
mod server;

pub use connection::{serve_connection, ConnectionServices, JUNK_BAN_DURATION, MAX_REQUEST_LENGTH};
pub use context::ConnectionContext;
pub use messages::{
    parse_request, Notification, Request, Response, StratumErrorCode, StratumMethod,
};
pub use server::StratumListener;
