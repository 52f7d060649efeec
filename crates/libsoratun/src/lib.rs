//! Reach the SORACOM Unified Endpoint through a userspace WireGuard tunnel.
//!
//! Every exchange is driven by a JSON session descriptor: it is parsed into a
//! [`Session`], turned into a live [`Tunnel`], and used by one of the two
//! clients for a single request/response before the tunnel is closed.
//!
//! The [`ffi`] module exports `Send` and `SendUDP` for host applications in
//! other languages; Rust callers can use [`send`] and [`send_udp`] directly.
//!
//! # Example
//!
//! ```no_run
//! use soratun::{parse_configuration, ClientOptions, Tunnel, TunnelOptions, UnifiedEndpointHttpClient};
//! use http_body_util::BodyExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = parse_configuration(&std::fs::read("arc.json")?)?;
//!     let tunnel = Arc::new(Tunnel::create(&session, TunnelOptions::default()).await?);
//!
//!     let client = UnifiedEndpointHttpClient::new(tunnel.clone(), ClientOptions::default())?;
//!     let request = client.make_request("POST", "/", r#"{"temperature":20}"#)?;
//!     let response = client.do_request(request).await?;
//!     let body = response.into_body().collect().await?.to_bytes();
//!     println!("{}", String::from_utf8_lossy(&body));
//!
//!     tunnel.close();
//!     Ok(())
//! }
//! ```

use std::net::Ipv4Addr;

pub mod client;
pub mod config;
mod connector;
pub mod error;
pub mod ffi;
pub mod tunnel;
pub mod udp;

pub use client::{validate_request, ClientOptions, ResponseBody, UnifiedEndpointHttpClient};
pub use config::{parse_configuration, ArcSession, Endpoint, Key, LogLevel, RoutingPrefix, Session};
pub use connector::{TunnelConnector, TunnelStream};
pub use error::{Error, NetworkStage, ParseError, Result, TunnelStage, ValidationError};
pub use ffi::{send, send_udp};
pub use tunnel::{
    engine_config, Connection, DatagramSocket, Dialer, Network, Tunnel, TunnelOptions, TunnelState,
};
pub use udp::UnifiedEndpointUdpClient;

// Re-export soratun-netstack types for convenience
pub use soratun_netstack::{NetStack, TcpConnection, TunnelResolver, UdpConnection};

/// Virtual address of the Unified Endpoint inside the tunnel.
pub const UNIFIED_ENDPOINT_HOST: Ipv4Addr = Ipv4Addr::new(100, 127, 69, 42);

/// HTTP port of the Unified Endpoint.
pub const UNIFIED_ENDPOINT_HTTP_PORT: u16 = 80;

/// UDP port of the Unified Endpoint.
pub const UNIFIED_ENDPOINT_UDP_PORT: u16 = 23080;

/// Resolvers registered on the tunnel interface.
pub const TUNNEL_DNS_SERVERS: [Ipv4Addr; 2] =
    [Ipv4Addr::new(100, 127, 0, 53), Ipv4Addr::new(100, 127, 1, 53)];

/// Port used for a server endpoint given without one.
pub const DEFAULT_ENDPOINT_PORT: u16 = 11010;

/// MTU of the tunnel interface.
pub const TUNNEL_MTU: usize = 1420;

/// Revision reported in the `User-Agent` header.
pub const REVISION: &str = match option_env!("SORATUN_REVISION") {
    Some(revision) => revision,
    None => env!("CARGO_PKG_VERSION"),
};
