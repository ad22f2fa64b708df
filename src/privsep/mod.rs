//! Privilege separation.
//!
//! The client runs as two processes. The privileged one keeps root and
//! changes kernel state; the unprivileged one speaks DHCP from a chroot
//! and tells it what to change over a socket pair, one [`PrivRequest`] at
//! a time. Nothing but the fixed requests in [`message`] crosses over.

pub mod channel;
pub mod message;
pub mod privileged;

pub use channel::PrivChannel;
pub use message::{PrivRequest, PrivsepError, RouteSpec};
pub use privileged::{Privileged, Shutdown};
