// crates/trimatrix-p2p/src/lib.rs
//
// trimatrix-p2p: peer networking layer for the Trimatrix node.
//
// Peers exchange newline-delimited JSON envelopes over persistent TCP
// connections. This crate provides the wire codec, the connected-peer set,
// the network node (handshake, discovery, broadcast, remote apply), and
// the ledger sync protocol handler.

pub mod envelope;
pub mod node;
pub mod peer;
pub mod sync;

pub use envelope::{negotiate_protocol, DecodeError, Message, DEFAULT_PROTOCOL, PROTOCOL_TAG};
pub use node::{NetworkConfig, PeerNetwork};
pub use peer::{PeerDirection, PeerInfo, PeerSet, PeerStatus};
