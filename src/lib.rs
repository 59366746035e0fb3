//! relaymesh
//!
//! Relay-brokered peer-to-peer task dispatch. A relay keeps a directory of
//! connected peers and forwards handshake payloads between them. A
//! coordinator picks an idle node from that directory, opens a direct
//! channel to it and sends programs over it; the node runs each program in
//! a sandbox and answers with exactly one result.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod node;
pub mod protocol;
pub mod relay;
pub mod sandbox;
pub mod transport;
pub mod version;

pub use error::{Error, Result};
