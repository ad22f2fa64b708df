//! DHCPv4 protocol implementation
//!
//! This module contains the DHCPv4-specific implementation including:
//! - Option encoding, decoding and pretty-printing
//! - Message construction and parsing
//! - Ethernet/IP/UDP framing for the packet socket
//! - State machine handling

pub mod framing;
pub mod handler;
pub mod message;
pub mod options;
pub mod pretty;

pub use handler::{Action, DhcpV4Handler, DhcpV4State};
pub use message::{make_decline, make_discover, make_request, DhcpPacket};
