//! Protocol Server Module
//!
//! The CSI endpoint: address parsing, the request transport and the server
//! lifecycle the orchestrator drives.

pub mod endpoint;
pub mod server;
pub mod transport;

pub use endpoint::{Endpoint, Listener};
pub use server::NonBlockingServer;
pub use transport::Router;
