//! # Gateway
//!
//! The dispatcher every request enters through, and the server that owns the
//! listener and the drain lifecycle.

pub mod dispatcher;
pub mod server;

pub use dispatcher::Dispatcher;
pub use server::GatewayServer;
