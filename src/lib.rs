//! Server-side RTMFP protocol engine.
//!
//! RTMFP is a UDP-based, encrypted, multiplexed session protocol used
//! for real-time client/server and peer-to-peer communication. This
//! crate implements the server end: wire codec, handshake and key
//! exchange, per-connection state machine with flow-controlled message
//! exchange and retransmission, group membership with latency-ordered
//! peer selection, NAT-traversal rendezvous and the periodic lifecycle
//! sweep.
//!
//! ## Architecture
//!
//! - `packet.rs` - byte cursor, checksum, connection-id obfuscation
//! - `amf.rs` - AMF0 value codec for command arguments
//! - `crypto.rs` - key exchange, session-key derivation, packet cipher
//! - `message.rs` - message parsing and serialization
//! - `connection.rs` - per-peer session state
//! - `group.rs` - group membership registry
//! - `server.rs` - UDP dispatch, sweep, rendezvous, event surface

pub mod amf;
pub mod connection;
pub mod crypto;
pub mod group;
pub mod message;
pub mod packet;
pub mod server;

pub use server::{
    BoundServer, ConnectDecision, DefaultHandler, RtmfpServer, ServerHandle, ServerSettings,
    SessionHandler,
};

/// RTMFP default port.
pub const DEFAULT_RTMFP_PORT: u16 = 1935;
