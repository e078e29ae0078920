//! CSI Services
//!
//! The three storage-protocol services a node driver serves on its endpoint.

pub mod controller;
pub mod identity;
pub mod node;

pub use controller::NodeControllerServer;
pub use identity::IdentityServer;
pub use node::NodeServer;
