//! Userspace TCP/IP network stack using smoltcp.
//!
//! [`create_net_tun`] builds a virtual interface bound to the tunnel address
//! and returns both halves of it: the [`NetStack`] that connections are made
//! on, and a [`TunDevice`] the WireGuard device drains outbound packets from.

use crate::error::{Error, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::socket::udp::{
    PacketBuffer as UdpPacketBuffer, PacketMetadata as UdpPacketMetadata, Socket as UdpSocket,
};
use smoltcp::time::Instant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpProtocol, Ipv4Address, Ipv4Packet, TcpPacket,
    UdpPacket,
};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Default MTU for the virtual interface.
pub const DEFAULT_MTU: usize = 1420;

/// Smallest MTU an IPv4 interface may use.
const MIN_MTU: usize = 576;

/// Size of TCP socket buffers.
const TCP_BUFFER_SIZE: usize = 65535;

/// Size of UDP socket payload buffers.
const UDP_BUFFER_SIZE: usize = 65535;

/// Number of datagrams a UDP socket can queue in each direction.
const UDP_PACKET_SLOTS: usize = 32;

/// Timeout for establishing TCP connections and for blocking reads/writes.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for the virtual interface.
#[derive(Debug, Clone)]
pub struct NetStackConfig {
    /// Our address inside the tunnel.
    pub address: Ipv4Addr,
    /// Resolvers registered as the interface's own upstream DNS servers.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Interface MTU.
    pub mtu: usize,
}

impl NetStackConfig {
    /// Create a configuration with the default MTU and no DNS servers.
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            dns_servers: Vec::new(),
            mtu: DEFAULT_MTU,
        }
    }
}

/// A virtual network device that sends/receives through the WireGuard tunnel.
struct VirtualDevice {
    /// Packets ready to be received by smoltcp (from WireGuard).
    rx_queue: VecDeque<BytesMut>,
    /// Packets ready to be sent (to WireGuard).
    tx_queue: VecDeque<BytesMut>,
    mtu: usize,
}

impl VirtualDevice {
    fn new(mtu: usize) -> Self {
        Self {
            rx_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
            mtu,
        }
    }

    fn push_rx(&mut self, packet: BytesMut) {
        self.rx_queue.push_back(packet);
    }

    fn drain_tx(&mut self) -> Vec<BytesMut> {
        self.tx_queue.drain(..).collect()
    }
}

struct VirtualRxToken {
    buffer: BytesMut,
}

impl RxToken for VirtualRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buffer)
    }
}

struct VirtualTxToken<'a> {
    tx_queue: &'a mut VecDeque<BytesMut>,
}

impl<'a> TxToken for VirtualTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = BytesMut::zeroed(len);
        let result = f(&mut buffer);
        self.tx_queue.push_back(buffer);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtualRxToken;
    type TxToken<'a> = VirtualTxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let buffer = self.rx_queue.pop_front()?;
        Some((
            VirtualRxToken { buffer },
            VirtualTxToken {
                tx_queue: &mut self.tx_queue,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken {
            tx_queue: &mut self.tx_queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

fn to_ip_address(addr: Ipv4Addr) -> IpAddress {
    let [a, b, c, d] = addr.octets();
    IpAddress::v4(a, b, c, d)
}

fn to_endpoint(addr: SocketAddr) -> Result<IpEndpoint> {
    match addr {
        SocketAddr::V4(v4) => Ok(IpEndpoint::new(to_ip_address(*v4.ip()), v4.port())),
        SocketAddr::V6(_) => Err(Error::Ipv6NotSupported),
    }
}

fn ephemeral_port() -> u16 {
    49152 + (rand::random::<u16>() % 16384)
}

/// Log a one-line summary of a TCP or UDP packet at debug level.
fn log_packet(direction: &str, packet: &[u8]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let Ok(ip_packet) = Ipv4Packet::new_checked(packet) else {
        return;
    };

    match ip_packet.next_header() {
        IpProtocol::Tcp => {
            let Ok(tcp_packet) = TcpPacket::new_checked(ip_packet.payload()) else {
                return;
            };
            let flags: Vec<&str> = [
                (tcp_packet.syn(), "SYN"),
                (tcp_packet.ack(), "ACK"),
                (tcp_packet.fin(), "FIN"),
                (tcp_packet.rst(), "RST"),
                (tcp_packet.psh(), "PSH"),
            ]
            .into_iter()
            .filter_map(|(set, name)| set.then_some(name))
            .collect();

            log::debug!(
                "{}: {}:{} -> {}:{} [{}] {} bytes",
                direction,
                ip_packet.src_addr(),
                tcp_packet.src_port(),
                ip_packet.dst_addr(),
                tcp_packet.dst_port(),
                flags.join(" "),
                tcp_packet.payload().len()
            );
        }
        IpProtocol::Udp => {
            let Ok(udp_packet) = UdpPacket::new_checked(ip_packet.payload()) else {
                return;
            };
            log::debug!(
                "{}: {}:{} -> {}:{} [UDP] {} bytes",
                direction,
                ip_packet.src_addr(),
                udp_packet.src_port(),
                ip_packet.dst_addr(),
                udp_packet.dst_port(),
                udp_packet.payload().len()
            );
        }
        _ => {}
    }
}

/// Shared state for the network stack.
struct NetStackInner {
    interface: Interface,
    device: VirtualDevice,
    sockets: SocketSet<'static>,
}

/// A userspace TCP/IP network stack.
pub struct NetStack {
    inner: Mutex<NetStackInner>,
    address: Ipv4Addr,
    dns_servers: Vec<Ipv4Addr>,
    mtu: usize,
    /// Sender to queue packets for transmission through WireGuard.
    outbound_tx: mpsc::Sender<BytesMut>,
    closed: AtomicBool,
}

/// The packet side of the virtual interface, consumed by the WireGuard device.
pub struct TunDevice {
    netstack: Arc<NetStack>,
    outbound_rx: mpsc::Receiver<BytesMut>,
}

impl TunDevice {
    /// The stack this device carries packets for.
    pub fn netstack(&self) -> &Arc<NetStack> {
        &self.netstack
    }

    /// Split into the stack and the receiver of packets the stack wants sent.
    pub fn into_parts(self) -> (Arc<NetStack>, mpsc::Receiver<BytesMut>) {
        (self.netstack, self.outbound_rx)
    }
}

/// Create a virtual interface bound to `config.address`.
pub fn create_net_tun(config: NetStackConfig) -> Result<(TunDevice, Arc<NetStack>)> {
    if config.address.is_unspecified() {
        return Err(Error::InvalidAddress(config.address.to_string()));
    }
    if config.mtu < MIN_MTU {
        return Err(Error::InvalidMtu(config.mtu));
    }

    let mut device = VirtualDevice::new(config.mtu);
    let iface_config = Config::new(HardwareAddress::Ip);
    let mut interface = Interface::new(iface_config, &mut device, Instant::now());

    let mut push_result = Ok(());
    interface.update_ip_addrs(|addrs| {
        push_result = addrs.push(IpCidr::new(to_ip_address(config.address), 32));
    });
    push_result.map_err(|_| Error::Interface("address table full".into()))?;

    // Route everything through this interface
    interface
        .routes_mut()
        .add_default_ipv4_route(Ipv4Address::new(0, 0, 0, 0))
        .map_err(|_| Error::Interface("route table full".into()))?;

    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    let netstack = Arc::new(NetStack {
        inner: Mutex::new(NetStackInner {
            interface,
            device,
            sockets: SocketSet::new(vec![]),
        }),
        address: config.address,
        dns_servers: config.dns_servers,
        mtu: config.mtu,
        outbound_tx,
        closed: AtomicBool::new(false),
    });

    log::debug!(
        "Created virtual interface {} (mtu {}, dns {:?})",
        netstack.address,
        netstack.mtu,
        netstack.dns_servers
    );

    let tun = TunDevice {
        netstack: netstack.clone(),
        outbound_rx,
    };
    Ok((tun, netstack))
}

impl NetStack {
    /// Our address inside the tunnel.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// DNS servers registered on the interface.
    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        &self.dns_servers
    }

    /// Interface MTU.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Mark the stack closed. New connections fail and existing ones stop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("Network stack {} closed", self.address);
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::NetStackClosed)
        } else {
            Ok(())
        }
    }

    /// Number of sockets currently held by the stack.
    pub fn socket_count(&self) -> usize {
        self.inner.lock().sockets.iter().count()
    }

    /// Create a new TCP socket and return its handle.
    pub fn create_tcp_socket(&self) -> Result<SocketHandle> {
        self.ensure_open()?;
        let mut inner = self.inner.lock();

        let rx_buffer = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let tx_buffer = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let socket = TcpSocket::new(rx_buffer, tx_buffer);

        Ok(inner.sockets.add(socket))
    }

    /// Connect a TCP socket to the given address.
    pub fn connect(&self, handle: SocketHandle, addr: SocketAddr) -> Result<()> {
        let remote = to_endpoint(addr)?;
        let local_addr = SocketAddrV4::new(self.address, ephemeral_port());
        let local = IpEndpoint::new(to_ip_address(*local_addr.ip()), local_addr.port());

        let mut inner = self.inner.lock();
        let NetStackInner {
            ref mut interface,
            ref mut sockets,
            ..
        } = *inner;
        let cx = interface.context();
        let socket = sockets.get_mut::<TcpSocket>(handle);
        socket
            .connect(cx, remote, local)
            .map_err(|e| Error::TcpConnectGeneric(format!("TCP connect failed: {}", e)))?;

        log::debug!("TCP socket connecting to {} from {}", addr, local_addr);

        Ok(())
    }

    /// Check if a TCP socket can send data.
    pub fn can_send(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).can_send()
    }

    /// Check if a TCP socket can receive data.
    pub fn can_recv(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).can_recv()
    }

    /// Check if a TCP socket may send data (connection in progress or established).
    pub fn may_send(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).may_send()
    }

    /// Check if a TCP socket may receive data.
    pub fn may_recv(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).may_recv()
    }

    /// Get the TCP socket state.
    pub fn socket_state(&self, handle: SocketHandle) -> TcpState {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).state()
    }

    /// Send data on a TCP socket.
    pub fn send(&self, handle: SocketHandle, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let socket = inner.sockets.get_mut::<TcpSocket>(handle);

        socket
            .send_slice(data)
            .map_err(|e| Error::TcpSend(e.to_string()))
    }

    /// Receive data from a TCP socket.
    pub fn recv(&self, handle: SocketHandle, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let socket = inner.sockets.get_mut::<TcpSocket>(handle);

        socket
            .recv_slice(buffer)
            .map_err(|e| Error::TcpRecv(e.to_string()))
    }

    /// Close a TCP socket.
    pub fn close_tcp(&self, handle: SocketHandle) {
        let mut inner = self.inner.lock();
        inner.sockets.get_mut::<TcpSocket>(handle).close();
    }

    /// Create a UDP socket bound to an ephemeral port.
    pub fn create_udp_socket(&self) -> Result<(SocketHandle, u16)> {
        self.ensure_open()?;
        let mut inner = self.inner.lock();

        let rx_buffer = UdpPacketBuffer::new(
            vec![UdpPacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let tx_buffer = UdpPacketBuffer::new(
            vec![UdpPacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let mut socket = UdpSocket::new(rx_buffer, tx_buffer);

        let port = ephemeral_port();
        socket
            .bind(port)
            .map_err(|e| Error::UdpBind(e.to_string()))?;

        Ok((inner.sockets.add(socket), port))
    }

    /// Check if a UDP socket has room for another datagram.
    pub fn udp_can_send(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<UdpSocket>(handle).can_send()
    }

    /// Check if a UDP socket has a datagram waiting.
    pub fn udp_can_recv(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<UdpSocket>(handle).can_recv()
    }

    /// Queue one datagram for `remote`.
    pub fn udp_send(&self, handle: SocketHandle, data: &[u8], remote: SocketAddr) -> Result<()> {
        let remote = to_endpoint(remote)?;
        let mut inner = self.inner.lock();
        let socket = inner.sockets.get_mut::<UdpSocket>(handle);

        socket
            .send_slice(data, remote)
            .map_err(|e| Error::UdpSend(e.to_string()))
    }

    /// Dequeue one datagram into `buffer`, dropping the bytes that do not fit.
    ///
    /// Returns the number of bytes copied and the sender of the datagram.
    pub fn udp_recv(&self, handle: SocketHandle, buffer: &mut [u8]) -> Result<(usize, IpEndpoint)> {
        let mut inner = self.inner.lock();
        let socket = inner.sockets.get_mut::<UdpSocket>(handle);

        let (payload, meta) = socket.recv().map_err(|e| Error::UdpRecv(e.to_string()))?;
        let len = payload.len().min(buffer.len());
        buffer[..len].copy_from_slice(&payload[..len]);
        if len < payload.len() {
            log::debug!("UDP datagram truncated from {} to {} bytes", payload.len(), len);
        }

        Ok((len, meta.endpoint))
    }

    /// Remove a socket from the socket set.
    pub fn remove_socket(&self, handle: SocketHandle) {
        let mut inner = self.inner.lock();
        inner.sockets.remove(handle);
    }

    /// Poll the network stack, processing packets and updating socket states.
    /// Returns true if there was any activity.
    pub fn poll(&self) -> bool {
        let mut inner = self.inner.lock();

        let NetStackInner {
            ref mut interface,
            ref mut device,
            ref mut sockets,
        } = *inner;

        let processed = interface.poll(Instant::now(), device, sockets);

        // Drain transmitted packets and send through WireGuard
        let tx_packets = device.drain_tx();
        drop(inner);

        for packet in tx_packets {
            log_packet("TX", &packet);
            if let Err(e) = self.outbound_tx.try_send(packet) {
                log::warn!("Dropping outbound packet: {}", e);
            }
        }

        processed
    }

    /// Push a received packet (from WireGuard) into the network stack.
    pub fn push_rx_packet(&self, packet: BytesMut) {
        log_packet("RX", &packet);
        let mut inner = self.inner.lock();
        inner.device.push_rx(packet);
    }

    /// Run the network stack polling loop.
    pub async fn run_poll_loop(self: &Arc<Self>) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(1));

        while !self.is_closed() {
            interval.tick().await;
            self.poll();
        }

        Ok(())
    }

    /// Run the receive loop that takes packets from WireGuard and feeds them to the stack.
    pub async fn run_rx_loop(self: &Arc<Self>, mut rx: mpsc::Receiver<BytesMut>) -> Result<()> {
        while let Some(packet) = rx.recv().await {
            self.push_rx_packet(packet);
            self.poll();
        }

        Ok(())
    }
}

/// Removes a socket from the stack on drop unless disarmed.
///
/// Keeps a cancelled connect from leaving a half-open socket behind.
struct SocketGuard<'a> {
    netstack: &'a NetStack,
    handle: Option<SocketHandle>,
}

impl<'a> SocketGuard<'a> {
    fn new(netstack: &'a NetStack, handle: SocketHandle) -> Self {
        Self {
            netstack,
            handle: Some(handle),
        }
    }

    fn disarm(mut self) -> SocketHandle {
        // handle is only None after disarm, which consumes the guard
        self.handle.take().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for SocketGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.netstack.remove_socket(handle);
        }
    }
}

/// Schedule a wake-up for a pending poll.
fn wake_soon(cx: &Context<'_>) {
    let waker = cx.waker().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        waker.wake();
    });
}

/// A TCP connection through our network stack.
pub struct TcpConnection {
    netstack: Arc<NetStack>,
    handle: SocketHandle,
    remote: SocketAddr,
}

impl TcpConnection {
    /// Create a new TCP connection.
    ///
    /// Dropping the returned future before it resolves removes the pending socket.
    pub async fn connect(netstack: Arc<NetStack>, addr: SocketAddr) -> Result<Self> {
        let handle = netstack.create_tcp_socket()?;
        let guard = SocketGuard::new(&netstack, handle);
        netstack.connect(handle, addr)?;

        let start = std::time::Instant::now();

        loop {
            netstack.ensure_open()?;
            netstack.poll();

            let state = netstack.socket_state(handle);
            log::trace!("TCP state: {:?}", state);

            if state == TcpState::Established {
                log::info!("TCP connection established to {}", addr);
                let handle = guard.disarm();
                return Ok(Self {
                    netstack,
                    handle,
                    remote: addr,
                });
            }

            if state == TcpState::Closed || state == TcpState::TimeWait {
                return Err(Error::TcpConnect {
                    addr,
                    message: format!("Connection failed (state: {:?})", state),
                });
            }

            if start.elapsed() > IO_TIMEOUT {
                return Err(Error::TcpTimeout);
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// The remote address of this connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Shutdown the connection.
    pub fn shutdown(&self) {
        self.netstack.close_tcp(self.handle);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.netstack.close_tcp(self.handle);
        // Give time for FIN to be sent
        self.netstack.poll();
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let netstack = &self.netstack;
        if netstack.is_closed() {
            return Poll::Ready(Err(Error::NetStackClosed.into()));
        }

        netstack.poll();

        if netstack.can_recv(self.handle) {
            match netstack.recv(self.handle, buf.initialize_unfilled()) {
                Ok(n) if n > 0 => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(_) => {}
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }

        if !netstack.may_recv(self.handle) {
            // Connection closed
            return Poll::Ready(Ok(()));
        }

        wake_soon(cx);
        Poll::Pending
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let netstack = &self.netstack;
        if netstack.is_closed() {
            return Poll::Ready(Err(Error::NetStackClosed.into()));
        }

        netstack.poll();

        if netstack.can_send(self.handle) {
            return match netstack.send(self.handle, buf) {
                Ok(n) => {
                    netstack.poll();
                    Poll::Ready(Ok(n))
                }
                Err(e) => Poll::Ready(Err(e.into())),
            };
        }

        if !netstack.may_send(self.handle) {
            return Poll::Ready(Err(Error::ConnectionClosed.into()));
        }

        wake_soon(cx);
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.netstack.poll();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdown();
        self.netstack.poll();
        Poll::Ready(Ok(()))
    }
}

/// A UDP association through our network stack, fixed to one remote address.
pub struct UdpConnection {
    netstack: Arc<NetStack>,
    handle: SocketHandle,
    local_port: u16,
    remote: SocketAddr,
}

impl UdpConnection {
    /// Bind an ephemeral port and associate it with `remote`.
    pub fn connect(netstack: Arc<NetStack>, remote: SocketAddr) -> Result<Self> {
        if remote.is_ipv6() {
            return Err(Error::Ipv6NotSupported);
        }
        let (handle, local_port) = netstack.create_udp_socket()?;
        log::debug!("UDP socket {} associated with {}", local_port, remote);

        Ok(Self {
            netstack,
            handle,
            local_port,
            remote,
        })
    }

    /// The local port of this association.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The remote address of this association.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send one datagram to the remote address.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        let start = std::time::Instant::now();

        loop {
            self.netstack.ensure_open()?;
            self.netstack.poll();

            if self.netstack.udp_can_send(self.handle) {
                self.netstack.udp_send(self.handle, data, self.remote)?;
                self.netstack.poll();
                log::trace!("UDP sent {} bytes to {}", data.len(), self.remote);
                return Ok(data.len());
            }

            if start.elapsed() > IO_TIMEOUT {
                return Err(Error::WriteTimeout);
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Receive one datagram from the remote address. Datagrams from any other
    /// source are discarded. Waits without a deadline; callers bound it themselves.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let remote = to_endpoint(self.remote)?;

        loop {
            self.netstack.ensure_open()?;
            self.netstack.poll();

            if self.netstack.udp_can_recv(self.handle) {
                let (len, source) = self.netstack.udp_recv(self.handle, buf)?;
                if source == remote {
                    return Ok(len);
                }
                log::debug!("Dropping UDP datagram from {} (expected {})", source, self.remote);
                continue;
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        self.netstack.remove_socket(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::{Ipv4Repr, TcpControl, TcpRepr, TcpSeqNumber, UdpRepr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local_ip() -> Ipv4Address {
        Ipv4Address::new(100, 127, 10, 2)
    }

    fn peer_ip() -> Ipv4Address {
        Ipv4Address::new(100, 127, 69, 42)
    }

    /// Build an IPv4 packet from the peer to the stack around a transport payload.
    fn inbound_ipv4(
        protocol: IpProtocol,
        payload_len: usize,
        emit: impl FnOnce(&mut [u8]),
    ) -> BytesMut {
        let repr = Ipv4Repr {
            src_addr: peer_ip(),
            dst_addr: local_ip(),
            next_header: protocol,
            payload_len,
            hop_limit: 64,
        };
        let mut buf = vec![0u8; repr.buffer_len() + payload_len];
        let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
        repr.emit(&mut packet, &ChecksumCapabilities::default());
        emit(packet.payload_mut());
        BytesMut::from(&buf[..])
    }

    fn inbound_udp(src_port: u16, dst_port: u16, payload: &[u8]) -> BytesMut {
        let repr = UdpRepr { src_port, dst_port };
        inbound_ipv4(IpProtocol::Udp, repr.header_len() + payload.len(), |buf| {
            let mut packet = UdpPacket::new_unchecked(buf);
            repr.emit(
                &mut packet,
                &IpAddress::Ipv4(peer_ip()),
                &IpAddress::Ipv4(local_ip()),
                payload.len(),
                |out| out.copy_from_slice(payload),
                &ChecksumCapabilities::default(),
            );
        })
    }

    fn inbound_tcp(repr: &TcpRepr) -> BytesMut {
        inbound_ipv4(IpProtocol::Tcp, repr.buffer_len(), |buf| {
            let mut packet = TcpPacket::new_unchecked(buf);
            repr.emit(
                &mut packet,
                &IpAddress::Ipv4(peer_ip()),
                &IpAddress::Ipv4(local_ip()),
                &ChecksumCapabilities::default(),
            );
        })
    }

    fn parse_tcp(packet: &[u8]) -> TcpRepr<'_> {
        let ip_packet = Ipv4Packet::new_checked(packet).unwrap();
        let tcp_packet = TcpPacket::new_checked(ip_packet.payload()).unwrap();
        TcpRepr::parse(
            &tcp_packet,
            &IpAddress::Ipv4(ip_packet.src_addr()),
            &IpAddress::Ipv4(ip_packet.dst_addr()),
            &ChecksumCapabilities::default(),
        )
        .unwrap()
    }

    /// Wait for the next TCP segment the stack hands to the device.
    async fn next_tcp_segment(outbound_rx: &mut mpsc::Receiver<BytesMut>) -> BytesMut {
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(5), outbound_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if Ipv4Packet::new_checked(&packet[..]).unwrap().next_header() == IpProtocol::Tcp {
                return packet;
            }
        }
    }

    fn stack() -> (TunDevice, Arc<NetStack>) {
        let mut config = NetStackConfig::new(Ipv4Addr::new(100, 127, 10, 2));
        config.dns_servers = vec![Ipv4Addr::new(100, 127, 0, 53)];
        create_net_tun(config).unwrap()
    }

    #[test]
    fn test_create_net_tun() {
        let (_tun, netstack) = stack();
        assert_eq!(netstack.address(), Ipv4Addr::new(100, 127, 10, 2));
        assert_eq!(netstack.mtu(), DEFAULT_MTU);
        assert_eq!(netstack.dns_servers(), &[Ipv4Addr::new(100, 127, 0, 53)]);
        assert_eq!(netstack.socket_count(), 0);
    }

    #[test]
    fn test_create_net_tun_rejects_bad_config() {
        assert!(matches!(
            create_net_tun(NetStackConfig::new(Ipv4Addr::UNSPECIFIED)),
            Err(Error::InvalidAddress(_))
        ));

        let mut config = NetStackConfig::new(Ipv4Addr::new(10, 0, 0, 2));
        config.mtu = 100;
        assert!(matches!(create_net_tun(config), Err(Error::InvalidMtu(100))));
    }

    #[tokio::test]
    async fn test_udp_datagram_reaches_device() {
        let (tun, netstack) = stack();
        let (_, mut outbound_rx) = tun.into_parts();

        let conn = UdpConnection::connect(netstack.clone(), "100.127.69.42:23080".parse().unwrap())
            .unwrap();
        assert_eq!(conn.send(b"hello").await.unwrap(), 5);

        let packet = outbound_rx.recv().await.unwrap();
        let ip_packet = Ipv4Packet::new_checked(&packet[..]).unwrap();
        assert_eq!(ip_packet.next_header(), IpProtocol::Udp);
        assert_eq!(ip_packet.src_addr(), Ipv4Address::new(100, 127, 10, 2));
        assert_eq!(ip_packet.dst_addr(), Ipv4Address::new(100, 127, 69, 42));

        let udp_packet = UdpPacket::new_checked(ip_packet.payload()).unwrap();
        assert_eq!(udp_packet.dst_port(), 23080);
        assert_eq!(udp_packet.src_port(), conn.local_port());
        assert_eq!(udp_packet.payload(), b"hello");

        drop(conn);
        assert_eq!(netstack.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_socket() {
        let (_tun, netstack) = stack();

        let connect = TcpConnection::connect(netstack.clone(), "100.127.69.42:80".parse().unwrap());
        let result = tokio::time::timeout(Duration::from_millis(50), connect).await;

        assert!(result.is_err());
        assert_eq!(netstack.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_stack_refuses_connections() {
        let (_tun, netstack) = stack();
        netstack.close();
        netstack.close();
        assert!(netstack.is_closed());

        let result = TcpConnection::connect(netstack.clone(), "100.127.69.42:80".parse().unwrap()).await;
        assert!(matches!(result, Err(Error::NetStackClosed)));

        let result = UdpConnection::connect(netstack, "100.127.69.42:23080".parse().unwrap());
        assert!(matches!(result, Err(Error::NetStackClosed)));
    }

    #[test]
    fn test_ipv6_remote_rejected() {
        let (_tun, netstack) = stack();
        let result = UdpConnection::connect(netstack, "[::1]:53".parse().unwrap());
        assert!(matches!(result, Err(Error::Ipv6NotSupported)));
    }

    #[tokio::test]
    async fn test_udp_recv_truncates_long_datagram() {
        let (_tun, netstack) = stack();
        let conn = UdpConnection::connect(netstack.clone(), "100.127.69.42:23080".parse().unwrap())
            .unwrap();

        netstack.push_rx_packet(inbound_udp(23080, conn.local_port(), &[b'x'; 1200]));

        let mut buf = [0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1024);
        assert!(buf.iter().all(|&b| b == b'x'));
    }

    #[tokio::test]
    async fn test_udp_recv_ignores_other_sources() {
        let (_tun, netstack) = stack();
        let conn = UdpConnection::connect(netstack.clone(), "100.127.69.42:23080".parse().unwrap())
            .unwrap();

        netstack.push_rx_packet(inbound_udp(9999, conn.local_port(), b"stray"));
        netstack.push_rx_packet(inbound_udp(23080, conn.local_port(), b"reply"));

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn test_tcp_stream_through_stack() {
        let (tun, netstack) = stack();
        let (_, mut outbound_rx) = tun.into_parts();
        let remote: SocketAddr = "100.127.69.42:80".parse().unwrap();

        let connect = tokio::spawn(TcpConnection::connect(netstack.clone(), remote));

        let syn_packet = next_tcp_segment(&mut outbound_rx).await;
        let syn = parse_tcp(&syn_packet);
        assert_eq!(syn.control, TcpControl::Syn);
        assert_eq!(syn.dst_port, 80);

        let peer_isn = TcpSeqNumber(1000);
        let mut syn_ack = syn;
        syn_ack.src_port = syn.dst_port;
        syn_ack.dst_port = syn.src_port;
        syn_ack.seq_number = peer_isn;
        syn_ack.ack_number = Some(syn.seq_number + 1);
        syn_ack.window_len = 64240;
        netstack.push_rx_packet(inbound_tcp(&syn_ack));

        let mut conn = tokio::time::timeout(Duration::from_secs(5), connect)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(conn.remote_addr(), remote);

        conn.write_all(b"GET").await.unwrap();

        // Skip the bare ACK that completes the handshake
        let data_packet = loop {
            let packet = next_tcp_segment(&mut outbound_rx).await;
            if !parse_tcp(&packet).payload.is_empty() {
                break packet;
            }
        };
        let data = parse_tcp(&data_packet);
        assert_eq!(data.payload, b"GET");
        assert_eq!(data.seq_number, syn.seq_number + 1);

        let mut fin = data;
        fin.src_port = data.dst_port;
        fin.dst_port = data.src_port;
        fin.control = TcpControl::Fin;
        fin.seq_number = peer_isn + 1;
        fin.ack_number = Some(data.seq_number + data.payload.len());
        fin.window_scale = None;
        fin.max_seg_size = None;
        fin.sack_permitted = false;
        fin.sack_ranges = [None; 3];
        fin.payload = &[];
        netstack.push_rx_packet(inbound_tcp(&fin));

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        netstack.close();
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
