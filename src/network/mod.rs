//! Network layer for relaying changes between nodes.

pub mod bus;
pub mod rpc;
pub mod server;

pub use bus::{LeaderTracker, TcpMessageBus};
pub use rpc::Envelope;
pub use server::NetworkServer;
