//! Server side of the MySQL client/server protocol: handshake, response
//! packets and a per-connection command loop in front of a pluggable
//! [`CommandDispatcher`](dispatcher::CommandDispatcher).

pub mod api;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod telemetry;
