//! # Tether - A Privilege-Separated DHCPv4 Client
//!
//! Tether acquires and keeps an IPv4 lease on one interface. It runs as two
//! processes: an unprivileged one that speaks DHCP from a chroot, and a
//! privileged one that changes addresses, routes, the MTU and
//! `resolv.conf` on its behalf. Only a fixed set of binary requests
//! crosses between them.
//!
//! ## Features
//!
//! - Full client state machine: INIT-REBOOT, DORA, renewing and rebinding,
//!   with fallback to recorded leases when no server answers
//! - Raw Ethernet transmission before the interface has an address
//! - Lease database and option dump in the familiar dhclient format
//! - A dhclient.conf subset for timing, option policy and static leases
//! - Arbitration between clients started on the same interface
//!
//! ## Example
//!
//! The protocol state machine is a plain value driven by the caller:
//!
//! ```rust,no_run
//! use rand::{rngs::StdRng, SeedableRng};
//! use tether::{
//!     lease::LeaseStore,
//!     network::{host::SystemHost, Interface},
//!     ClientConfig, DhcpV4Handler,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let interface = Interface::lookup("eth0")?;
//!     let mut config = ClientConfig::new("eth0".to_string());
//!     config.set_default_client_identifier(interface.hw);
//!
//!     let mut handler = DhcpV4Handler::new(
//!         interface,
//!         config,
//!         LeaseStore::default(),
//!         Box::new(SystemHost),
//!         StdRng::from_os_rng(),
//!     );
//!     handler.start(tether::client::now());
//!     for action in handler.drain_actions() {
//!         println!("{action:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod lexer;
pub mod network;
pub mod privsep;
pub mod process;
pub mod v4;

pub use client::DhcpClient;
pub use config::{Args, ClientConfig};
pub use error::TetherError;
pub use v4::DhcpV4Handler;
