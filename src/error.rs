use crate::{
    lexer::ParseError,
    network::{netlink::NetlinkError, SocketError},
    privsep::message::PrivsepError,
    v4::{framing::FrameError, message::PacketError, options::OptionError},
};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Socket operation failed: {0}")]
    Socket(#[from] SocketError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed options: {0}")]
    Option(#[from] OptionError),

    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("DHCP packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Privilege separation failure: {0}")]
    Privsep(#[from] PrivsepError),

    #[error("Routing socket failure: {0}")]
    Netlink(#[from] NetlinkError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Failed to parse MAC address: {0}")]
    MacParse(String),

    #[error("Interface '{0}' not found or has no MAC address")]
    InterfaceInvalid(String),

    #[error("No such user: {0}")]
    UnknownUser(String),

    #[error("State machine reached a critical failure: {0}")]
    Critical(String),
}
