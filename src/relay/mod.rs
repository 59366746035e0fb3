//! Directory/relay
//!
//! The server side (`registry`, `server`) and the control-connection client
//! used by nodes and coordinators (`client`).

mod client;
mod registry;
mod server;

pub use client::{ConnectionState, RelayClient, RelayClientConfig, RelayCommand, RelayEvent};
pub use registry::{
    ConnectionId, DuplicatePolicy, Outbox, PeerRecord, PeerRegistry, RegisterOutcome,
};
pub use server::RelayServer;
