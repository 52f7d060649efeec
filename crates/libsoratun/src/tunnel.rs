//! Tunnel lifecycle: turns a [`Session`] into a live WireGuard interface.
//!
//! A [`Tunnel`] owns the device and its network stack. It is created in one
//! step by [`Tunnel::create`] and lives until [`Tunnel::close`] or drop;
//! after that every dial or lookup fails with a closed-stack error.

use crate::config::{split_host_port, ArcSession, Key, Session};
use crate::error::{Error, Result, TunnelStage};
use crate::{TUNNEL_DNS_SERVERS, TUNNEL_MTU};
use parking_lot::Mutex;
use soratun_netstack::{
    create_net_tun, NetStack, NetStackConfig, TcpConnection, TunnelResolver, UdpConnection,
    WireGuardDevice,
};
use std::fmt::Write as _;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Lifecycle of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Uninitialized,
    Configuring,
    Up,
    Closed,
}

/// Tunables for tunnel creation.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// How long activation waits for the first handshake. `None` returns as
    /// soon as the handshake initiation has been sent.
    pub handshake_timeout: Option<Duration>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Build the engine configuration block for a session.
///
/// Without explicit allowed prefixes the peer is given a catch-all IPv4 route.
pub fn engine_config(private_key: &Key, arc: &ArcSession) -> String {
    let mut text = format!(
        "private_key={}\npublic_key={}\nendpoint={}\n",
        private_key.to_hex(),
        arc.server_peer_public_key.to_hex(),
        arc.server_endpoint
    );

    if arc.allowed_ips.is_empty() {
        text.push_str("allowed_ip=0.0.0.0/0\n");
    } else {
        for prefix in &arc.allowed_ips {
            let _ = writeln!(text, "allowed_ip={}", prefix);
        }
    }

    text
}

/// Transport requested from [`Tunnel::dial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" | "tcp4" => Ok(Network::Tcp),
            "udp" | "udp4" => Ok(Network::Udp),
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// A connection made through the tunnel.
pub enum Connection {
    Tcp(TcpConnection),
    Udp(UdpConnection),
}

/// Something that can open connections by `host:port` address.
///
/// [`Tunnel`] is the production implementation; the clients are generic over
/// it so they can run over other transports.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Datagram: DatagramSocket + Send + Sync + 'static;

    fn dial_stream<'a>(
        &'a self,
        address: &'a str,
    ) -> impl Future<Output = Result<Self::Stream>> + Send + 'a;

    fn dial_datagram<'a>(
        &'a self,
        address: &'a str,
    ) -> impl Future<Output = Result<Self::Datagram>> + Send + 'a;
}

/// A connected datagram socket.
pub trait DatagramSocket {
    fn send<'a>(&'a self, data: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    fn recv<'a>(&'a self, buf: &'a mut [u8])
        -> impl Future<Output = io::Result<usize>> + Send + 'a;
}

impl DatagramSocket for UdpConnection {
    fn send<'a>(&'a self, data: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async move { Ok(UdpConnection::send(self, data).await?) }
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async move { Ok(UdpConnection::recv(self, buf).await?) }
    }
}

/// A running WireGuard tunnel with its own virtual interface.
pub struct Tunnel {
    device: Mutex<WireGuardDevice>,
    netstack: Arc<NetStack>,
    resolver: TunnelResolver,
}

impl Tunnel {
    /// Create the interface, configure the engine and bring it up.
    ///
    /// Fails with [`Error::MissingSession`] before anything is created when the
    /// session has no `arcSessionStatus`. Any later failure closes what was
    /// built so far.
    pub async fn create(session: &Session, options: TunnelOptions) -> Result<Self> {
        let arc = session.arc_session.as_ref().ok_or(Error::MissingSession)?;

        log::debug!("Tunnel state: {:?}", TunnelState::Uninitialized);
        log::debug!("Session configuration:\n{}", session);

        let address = match arc.client_peer_ip_address {
            Some(IpAddr::V4(address)) => address,
            Some(IpAddr::V6(address)) => {
                log::error!("Client address {} is not IPv4", address);
                return Err(Error::tunnel(TunnelStage::Create)(
                    soratun_netstack::Error::Ipv6NotSupported,
                ));
            }
            None => {
                return Err(Error::tunnel(TunnelStage::Create)(
                    soratun_netstack::Error::InvalidAddress(
                        "arcClientPeerIpAddress is not set".into(),
                    ),
                ));
            }
        };

        let (tun, netstack) = create_net_tun(NetStackConfig {
            address,
            dns_servers: TUNNEL_DNS_SERVERS.to_vec(),
            mtu: TUNNEL_MTU,
        })
        .map_err(Error::tunnel(TunnelStage::Create))?;

        let mut device = WireGuardDevice::new(tun);
        log::debug!("Tunnel state: {:?}", TunnelState::Configuring);

        device
            .ipc_set(&engine_config(&session.private_key, arc))
            .map_err(Error::tunnel(TunnelStage::Configure))?;

        device
            .up()
            .await
            .map_err(Error::tunnel(TunnelStage::Activate))?;

        if let Some(timeout) = options.handshake_timeout {
            device
                .wait_for_handshake(timeout)
                .await
                .map_err(Error::tunnel(TunnelStage::Activate))?;
        }

        log::info!("Tunnel up: {} via {}", address, arc.server_endpoint);
        log::debug!("Tunnel state: {:?}", TunnelState::Up);

        let resolver = TunnelResolver::new(netstack.clone());
        Ok(Self {
            device: Mutex::new(device),
            netstack,
            resolver,
        })
    }

    pub fn state(&self) -> TunnelState {
        if self.device.lock().is_closed() {
            TunnelState::Closed
        } else {
            TunnelState::Up
        }
    }

    /// The tunnel's network stack.
    pub fn netstack(&self) -> &Arc<NetStack> {
        &self.netstack
    }

    /// Resolver that sends every lookup through the tunnel's DNS servers.
    pub fn resolver(&self) -> TunnelResolver {
        self.resolver.clone()
    }

    /// Time since the last completed handshake with the server.
    pub fn time_since_last_handshake(&self) -> Option<Duration> {
        self.device.lock().time_since_last_handshake()
    }

    /// Open a connection to `address` (`host:port`) over `network`
    /// (`tcp`, `tcp4`, `udp` or `udp4`).
    ///
    /// Dropping the returned future abandons the attempt and releases its socket.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Connection> {
        match network.parse::<Network>()? {
            Network::Tcp => Ok(Connection::Tcp(self.dial_tcp(address).await?)),
            Network::Udp => Ok(Connection::Udp(self.dial_udp(address).await?)),
        }
    }

    pub async fn dial_tcp(&self, address: &str) -> Result<TcpConnection> {
        let addr = self.resolve_address(address).await?;
        log::debug!("Dialing tcp {} ({})", address, addr);
        Ok(TcpConnection::connect(self.netstack.clone(), addr).await?)
    }

    pub async fn dial_udp(&self, address: &str) -> Result<UdpConnection> {
        let addr = self.resolve_address(address).await?;
        log::debug!("Dialing udp {} ({})", address, addr);
        Ok(UdpConnection::connect(self.netstack.clone(), addr)?)
    }

    async fn resolve_address(&self, address: &str) -> Result<std::net::SocketAddr> {
        if self.netstack.is_closed() {
            return Err(soratun_netstack::Error::NetStackClosed.into());
        }

        let invalid = || soratun_netstack::Error::InvalidAddress(address.to_string());
        let (host, port) = split_host_port(address).ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(self.resolver.resolve_addr(host, port).await?)
    }

    /// Shut the engine down and close the interface. Safe to call repeatedly.
    pub fn close(&self) {
        let mut device = self.device.lock();
        if !device.is_closed() {
            device.close();
            log::debug!("Tunnel state: {:?}", TunnelState::Closed);
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

impl Dialer for Tunnel {
    type Stream = TcpConnection;
    type Datagram = UdpConnection;

    fn dial_stream<'a>(
        &'a self,
        address: &'a str,
    ) -> impl Future<Output = Result<Self::Stream>> + Send + 'a {
        self.dial_tcp(address)
    }

    fn dial_datagram<'a>(
        &'a self,
        address: &'a str,
    ) -> impl Future<Output = Result<Self::Datagram>> + Send + 'a {
        self.dial_udp(address)
    }
}
