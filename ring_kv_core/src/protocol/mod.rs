//! Wire formats.
//!
//! Peers (coordinator and nodes) exchange one JSON object per line. Clients
//! speak a space-delimited text protocol on the same socket; a node tells
//! the two apart by the leading `{`.

pub mod client;
pub mod messages;

pub use client::{ClientRequest, ClientResponse, DELETE_SENTINEL};
pub use messages::{
    CoordAction, CoordMessage, EcsAction, EcsMessage, PeerMessage, Registration, ServerInfo,
};

/// True if a request line carries a JSON peer message.
pub fn is_peer_line(line: &str) -> bool {
    line.trim_start().starts_with('{')
}
