//! Userspace WireGuard device with a TCP/IP network stack.
//!
//! This crate provides:
//! - WireGuard tunnel implementation using gotatun, configured from UAPI text
//! - Userspace TCP/UDP/IP stack using smoltcp
//! - Plain DNS resolution through resolvers inside the tunnel
//!
//! # Example
//!
//! ```no_run
//! use soratun_netstack::{create_net_tun, NetStackConfig, TcpConnection, WireGuardDevice};
//! use std::time::Duration;
//! use tokio::io::AsyncWriteExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tun, netstack) = create_net_tun(NetStackConfig::new("10.0.0.2".parse()?))?;
//!
//!     let mut device = WireGuardDevice::new(tun);
//!     device.ipc_set(&std::fs::read_to_string("wg.uapi")?)?;
//!     device.up().await?;
//!     device.wait_for_handshake(Duration::from_secs(10)).await?;
//!
//!     let mut conn = TcpConnection::connect(netstack, "10.0.0.1:80".parse()?).await?;
//!     conn.write_all(b"GET / HTTP/1.1\r\nHost: 10.0.0.1\r\n\r\n").await?;
//!
//!     device.close();
//!     Ok(())
//! }
//! ```

pub mod device;
pub mod dns;
pub mod error;
pub mod netstack;
pub mod wireguard;

// Re-export main types
pub use device::WireGuardDevice;
pub use dns::TunnelResolver;
pub use error::{Error, Result};
pub use netstack::{
    create_net_tun, NetStack, NetStackConfig, TcpConnection, TunDevice, UdpConnection, DEFAULT_MTU,
};
pub use wireguard::{WireGuardConfig, WireGuardTunnel};
