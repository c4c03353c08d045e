//! wcap - tunnel raw 802.11 frames between two hosts over UDP.
//!
//! Each endpoint puts a monitor interface on its radio, gives its wired
//! interface a link-local address derived from the MAC, and relays every
//! frame seen on the monitor interface to the other endpoint as one UDP
//! datagram. Datagrams received are injected back on the monitor interface.
//!
//! # Architecture
//!
//! - [`directory`]: kernel interface directory (route netlink, nl80211)
//! - [`provision`]: monitor interface and link-local address provisioning
//! - [`network`]: raw link and UDP sockets, multiplexed wait
//! - [`relay`]: the frame relay loop
//! - [`tunnel`]: startup composition and teardown
//! - [`config`]: configuration loading and validation
//! - [`error`]: error types
//!
//! # Testing
//!
//! The kernel-facing pieces sit behind traits ([`directory::InterfaceDirectory`],
//! [`network::SocketFactory`], [`network::Poller`]), so the relay can be driven
//! over loopback sockets without privileges:
//!
//! ```rust
//! use std::net::{Ipv4Addr, UdpSocket};
//! use std::os::unix::net::UnixDatagram;
//!
//! use wcap::relay::{RelayContext, Role};
//!
//! let (link, _air) = UnixDatagram::pair().unwrap();
//! let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
//! let context = RelayContext::new(link, udp, Role::Client { peer: Ipv4Addr::LOCALHOST }, 8888);
//! assert_eq!(context.peer.unwrap().port(), 8888);
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod network;
pub mod provision;
pub mod relay;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};
