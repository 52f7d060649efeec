//! WireGuard tunnel implementation using gotatun.
//!
//! This module wraps gotatun's `Tunn` struct and manages the UDP transport
//! for sending/receiving encrypted WireGuard packets. Packets are filtered
//! against the peer's allowed prefixes in both directions.

use bytes::BytesMut;
use gotatun::noise::rate_limiter::RateLimiter;
use gotatun::noise::{Tunn, TunnResult};
use gotatun::packet::Packet;
use gotatun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use zerocopy::IntoBytes;

use crate::error::{Error, Result};

/// Configuration for the WireGuard tunnel.
#[derive(Clone)]
pub struct WireGuardConfig {
    /// Our private key (32 bytes).
    pub private_key: [u8; 32],
    /// Peer's public key (32 bytes).
    pub peer_public_key: [u8; 32],
    /// Peer's endpoint (IP:port).
    pub peer_endpoint: SocketAddr,
    /// Optional preshared key for additional security.
    pub preshared_key: Option<[u8; 32]>,
    /// Keepalive interval in seconds (None = disabled).
    pub keepalive_seconds: Option<u16>,
    /// Prefixes the peer may send from and we may send to.
    pub allowed_ips: Vec<IpNet>,
}

impl std::fmt::Debug for WireGuardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireGuardConfig")
            .field("peer_public_key", &hex::encode(self.peer_public_key))
            .field("peer_endpoint", &self.peer_endpoint)
            .field("keepalive_seconds", &self.keepalive_seconds)
            .field("allowed_ips", &self.allowed_ips)
            .finish_non_exhaustive()
    }
}

impl WireGuardConfig {
    /// Parse a device configuration block of newline separated `key=value` pairs.
    ///
    /// Recognised keys are `private_key`, `public_key`, `preshared_key`,
    /// `endpoint`, `persistent_keepalive_interval` and `allowed_ip` (repeatable).
    /// Keys are lowercase hex; everything after `public_key` belongs to the peer.
    ///
    /// ```
    /// use soratun_netstack::WireGuardConfig;
    ///
    /// let text = format!(
    ///     "private_key={}\npublic_key={}\nendpoint=192.0.2.1:11010\nallowed_ip=100.127.0.0/16\n",
    ///     "11".repeat(32),
    ///     "22".repeat(32),
    /// );
    /// let config = WireGuardConfig::from_uapi(&text).unwrap();
    /// assert_eq!(config.peer_endpoint.port(), 11010);
    /// assert_eq!(config.allowed_ips.len(), 1);
    /// ```
    pub fn from_uapi(text: &str) -> Result<Self> {
        let mut private_key = None;
        let mut peer_public_key = None;
        let mut peer_endpoint = None;
        let mut preshared_key = None;
        let mut keepalive_seconds = None;
        let mut allowed_ips = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }

            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| config_error(line, format!("expected key=value, got '{}'", entry)))?;
            let in_peer = peer_public_key.is_some();

            match key {
                "private_key" if in_peer => {
                    return Err(config_error(line, "private_key must precede the peer section"));
                }
                "private_key" => {
                    private_key = Some(decode_hex_key(value).map_err(|e| config_error(line, e))?);
                }
                "public_key" if in_peer => {
                    return Err(config_error(line, "only a single peer is supported"));
                }
                "public_key" => {
                    peer_public_key = Some(decode_hex_key(value).map_err(|e| config_error(line, e))?);
                }
                "preshared_key" | "endpoint" | "persistent_keepalive_interval" | "allowed_ip"
                    if !in_peer =>
                {
                    return Err(config_error(
                        line,
                        format!("'{}' appears before public_key", key),
                    ));
                }
                "preshared_key" => {
                    preshared_key = Some(decode_hex_key(value).map_err(|e| config_error(line, e))?);
                }
                "endpoint" => {
                    let addr: SocketAddr = value.parse().map_err(|_| {
                        config_error(line, Error::InvalidEndpoint(value.to_string()))
                    })?;
                    peer_endpoint = Some(addr);
                }
                "persistent_keepalive_interval" => {
                    let secs: u16 = value.parse().map_err(|_| {
                        config_error(line, format!("invalid keepalive interval '{}'", value))
                    })?;
                    keepalive_seconds = (secs > 0).then_some(secs);
                }
                "allowed_ip" => {
                    let net: IpNet = value.parse().map_err(|_| {
                        config_error(line, format!("invalid allowed_ip '{}'", value))
                    })?;
                    allowed_ips.push(net.trunc());
                }
                other => {
                    return Err(config_error(line, format!("unknown key '{}'", other)));
                }
            }
        }

        Ok(Self {
            private_key: private_key.ok_or(Error::MissingDeviceConfig("private_key"))?,
            peer_public_key: peer_public_key.ok_or(Error::MissingDeviceConfig("public_key"))?,
            peer_endpoint: peer_endpoint.ok_or(Error::MissingDeviceConfig("endpoint"))?,
            preshared_key,
            keepalive_seconds,
            allowed_ips,
        })
    }

    /// Whether traffic to or from `addr` may cross the tunnel.
    pub fn allows(&self, addr: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&addr))
    }
}

fn config_error(line: usize, message: impl ToString) -> Error {
    Error::DeviceConfig {
        line,
        message: message.to_string(),
    }
}

/// Decode a hex-encoded 32-byte key.
fn decode_hex_key(text: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(text).map_err(|_| Error::InvalidKey(text.to_string()))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| Error::InvalidKey(format!("Key must be 32 bytes, got {} bytes", v.len())))
}

/// Destination address of a raw IP packet.
fn packet_destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Source address of a raw IP packet.
fn packet_source(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[12..16].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[8..24].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// A WireGuard tunnel that encrypts/decrypts IP packets.
pub struct WireGuardTunnel {
    /// The underlying gotatun tunnel.
    tunn: Mutex<Tunn>,
    /// UDP socket for sending/receiving encrypted packets.
    udp_socket: Arc<UdpSocket>,
    /// Peer's endpoint address.
    peer_endpoint: SocketAddr,
    /// Peer's allowed prefixes.
    allowed_ips: Vec<IpNet>,
    /// Channel to send received IP packets.
    incoming_tx: mpsc::Sender<BytesMut>,
    /// Channel to receive incoming IP packets.
    incoming_rx: Mutex<Option<mpsc::Receiver<BytesMut>>>,
    /// Channel to receive IP packets to send.
    outgoing_rx: tokio::sync::Mutex<mpsc::Receiver<BytesMut>>,
}

impl WireGuardTunnel {
    /// Create a new WireGuard tunnel that encrypts packets read from `outgoing_rx`.
    pub async fn new(
        config: WireGuardConfig,
        outgoing_rx: mpsc::Receiver<BytesMut>,
    ) -> Result<Arc<Self>> {
        let private_key = StaticSecret::from(config.private_key);
        let peer_public_key = PublicKey::from(config.peer_public_key);

        let tunn = Tunn::new(
            private_key,
            peer_public_key,
            config.preshared_key,
            config.keepalive_seconds,
            rand::random::<u32>() >> 8, // Random index
            Arc::new(RateLimiter::new(&peer_public_key, 0)),
        );

        let bind_addr = match config.peer_endpoint {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let udp_socket = UdpSocket::bind(bind_addr).await?;

        let sock_ref = socket2::SockRef::from(&udp_socket);
        if let Err(e) = sock_ref.set_recv_buffer_size(1024 * 1024) {
            log::warn!("Failed to set UDP recv buffer size: {}", e);
        }
        if let Err(e) = sock_ref.set_send_buffer_size(1024 * 1024) {
            log::warn!("Failed to set UDP send buffer size: {}", e);
        }

        log::info!(
            "WireGuard UDP socket bound to {} (peer {})",
            udp_socket.local_addr()?,
            config.peer_endpoint
        );

        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        Ok(Arc::new(Self {
            tunn: Mutex::new(tunn),
            udp_socket: Arc::new(udp_socket),
            peer_endpoint: config.peer_endpoint,
            allowed_ips: config.allowed_ips,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            outgoing_rx: tokio::sync::Mutex::new(outgoing_rx),
        }))
    }

    /// Get the receiver for decrypted packets (takes ownership of the receiver).
    pub fn take_incoming_receiver(&self) -> Option<mpsc::Receiver<BytesMut>> {
        self.incoming_rx.lock().take()
    }

    /// Returns the time elapsed since the last successful WireGuard handshake.
    pub fn time_since_last_handshake(&self) -> Option<Duration> {
        let tunn = self.tunn.lock();
        tunn.stats().0
    }

    fn allows(&self, addr: Option<IpAddr>) -> bool {
        addr.is_some_and(|addr| self.allowed_ips.iter().any(|net| net.contains(&addr)))
    }

    /// Initiate the WireGuard handshake.
    pub async fn initiate_handshake(&self) -> Result<()> {
        log::info!("Initiating WireGuard handshake...");

        let handshake_init = {
            let mut tunn = self.tunn.lock();
            tunn.format_handshake_initiation(false)
        };

        if let Some(packet) = handshake_init {
            let data = packet.as_bytes();
            self.udp_socket.send_to(data, self.peer_endpoint).await?;
            log::debug!("Sent handshake initiation ({} bytes)", data.len());
        }

        Ok(())
    }

    /// Send an IP packet through the tunnel (encrypts and sends via UDP).
    pub async fn send_ip_packet(&self, packet: BytesMut) -> Result<()> {
        let destination = packet_destination(&packet);
        if !self.allows(destination) {
            log::trace!("Dropping outgoing packet to {:?}: not an allowed IP", destination);
            return Ok(());
        }

        let encrypted = {
            let mut tunn = self.tunn.lock();
            let pkt = Packet::from_bytes(packet);
            tunn.handle_outgoing_packet(pkt)
        };

        if let Some(wg_packet) = encrypted {
            let pkt: Packet = wg_packet.into();
            let data = pkt.as_bytes();
            self.udp_socket.send_to(data, self.peer_endpoint).await?;
            log::trace!("Sent encrypted packet ({} bytes)", data.len());
        }

        Ok(())
    }

    /// Process a received UDP packet (decrypts and returns IP packet if any).
    fn process_incoming_udp(&self, data: &[u8]) -> Option<BytesMut> {
        let packet = Packet::from_bytes(BytesMut::from(data));
        let wg_packet = match packet.try_into_wg() {
            Ok(wg) => wg,
            Err(_) => {
                log::warn!("Received non-WireGuard packet");
                return None;
            }
        };

        let mut tunn = self.tunn.lock();
        match tunn.handle_incoming_packet(wg_packet) {
            TunnResult::Done => None,
            TunnResult::Err(e) => {
                log::warn!("WG error: {:?}", e);
                None
            }
            TunnResult::WriteToNetwork(response) => {
                log::trace!("WG: Sending response packet");
                let pkt: Packet = response.into();
                self.spawn_send(BytesMut::from(pkt.as_bytes()));

                while let Some(queued) = tunn.next_queued_packet() {
                    let pkt: Packet = queued.into();
                    self.spawn_send(BytesMut::from(pkt.as_bytes()));
                }

                None
            }
            TunnResult::WriteToTunnel(decrypted) => {
                if decrypted.is_empty() {
                    log::trace!("WG: Received keepalive");
                    return None;
                }
                let bytes = BytesMut::from(decrypted.as_bytes());
                let source = packet_source(&bytes);
                if !self.allows(source) {
                    log::warn!("Dropping incoming packet from {:?}: not an allowed IP", source);
                    return None;
                }
                log::trace!("WG: Decrypted {} bytes", bytes.len());
                Some(bytes)
            }
        }
    }

    fn spawn_send(&self, data: BytesMut) {
        let socket = self.udp_socket.clone();
        let endpoint = self.peer_endpoint;
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&data, endpoint).await {
                log::error!("Failed to send packet to peer: {}", e);
            }
        });
    }

    /// Run the tunnel's receive loop (listens for UDP packets and decrypts them).
    pub async fn run_receive_loop(self: &Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; 65535];

        loop {
            match self.udp_socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if from != self.peer_endpoint {
                        log::warn!("Received packet from unknown peer: {}", from);
                        continue;
                    }

                    log::trace!("Received UDP packet ({} bytes) from {}", len, from);

                    if let Some(ip_packet) = self.process_incoming_udp(&buf[..len]) {
                        if self.incoming_tx.send(ip_packet).await.is_err() {
                            log::error!("Incoming channel closed");
                            break;
                        }
                    }
                }
                Err(e) => {
                    log::error!("UDP receive error: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Run the tunnel's send loop (encrypts and sends IP packets).
    pub async fn run_send_loop(self: &Arc<Self>) -> Result<()> {
        let mut outgoing_rx = self.outgoing_rx.lock().await;

        while let Some(packet) = outgoing_rx.recv().await {
            if let Err(e) = self.send_ip_packet(packet).await {
                log::error!("Failed to send packet: {}", e);
            }
        }

        Ok(())
    }

    /// Run the tunnel's timer loop (handles keepalives and handshake retries).
    pub async fn run_timer_loop(self: &Arc<Self>) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(250));

        loop {
            interval.tick().await;

            let packet = {
                let mut tunn = self.tunn.lock();
                match tunn.update_timers() {
                    Ok(Some(packet)) => {
                        let pkt: Packet = packet.into();
                        Some(pkt.as_bytes().to_vec())
                    }
                    Ok(None) => None,
                    Err(e) => {
                        log::trace!("Timer error (may be normal): {:?}", e);
                        None
                    }
                }
            };

            if let Some(packet) = packet {
                if let Err(e) = self.udp_socket.send_to(&packet, self.peer_endpoint).await {
                    log::error!("Failed to send timer packet: {}", e);
                }
            }
        }
    }

    /// Wait for the handshake to complete (with timeout).
    pub async fn wait_for_handshake(&self, timeout_duration: Duration) -> Result<()> {
        let start = std::time::Instant::now();

        loop {
            if self.time_since_last_handshake().is_some() {
                log::info!("WireGuard handshake completed!");
                return Ok(());
            }

            if start.elapsed() > timeout_duration {
                return Err(Error::HandshakeTimeout(timeout_duration));
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(extra: &str) -> String {
        format!(
            "private_key={}\npublic_key={}\nendpoint=192.0.2.10:11010\n{}",
            "aa".repeat(32),
            "bb".repeat(32),
            extra
        )
    }

    #[test]
    fn test_from_uapi() {
        let config =
            WireGuardConfig::from_uapi(&block("allowed_ip=100.127.0.0/16\nallowed_ip=10.1.2.3/8\n"))
                .unwrap();
        assert_eq!(config.private_key, [0xaa; 32]);
        assert_eq!(config.peer_public_key, [0xbb; 32]);
        assert_eq!(config.peer_endpoint, "192.0.2.10:11010".parse().unwrap());
        assert_eq!(config.keepalive_seconds, None);
        assert_eq!(
            config.allowed_ips,
            vec![
                "100.127.0.0/16".parse::<IpNet>().unwrap(),
                "10.0.0.0/8".parse::<IpNet>().unwrap()
            ]
        );
        assert!(config.allows("100.127.69.42".parse().unwrap()));
        assert!(!config.allows("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_from_uapi_keepalive_and_preshared_key() {
        let extra = format!(
            "preshared_key={}\npersistent_keepalive_interval=25\nallowed_ip=0.0.0.0/0\n",
            "cc".repeat(32)
        );
        let config = WireGuardConfig::from_uapi(&block(&extra)).unwrap();
        assert_eq!(config.preshared_key, Some([0xcc; 32]));
        assert_eq!(config.keepalive_seconds, Some(25));
        assert!(config.allows("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_from_uapi_rejects_bad_input() {
        // Empty endpoint
        let text = format!("private_key={}\npublic_key={}\nendpoint=\n", "aa".repeat(32), "bb".repeat(32));
        assert!(matches!(
            WireGuardConfig::from_uapi(&text),
            Err(Error::DeviceConfig { line: 3, .. })
        ));

        // Short key
        assert!(matches!(
            WireGuardConfig::from_uapi("private_key=abcd\n"),
            Err(Error::DeviceConfig { line: 1, .. })
        ));

        // Unknown key
        assert!(WireGuardConfig::from_uapi(&block("listen_port=1\n")).is_err());

        // Peer fields without a peer
        let text = format!("private_key={}\nendpoint=192.0.2.10:1\n", "aa".repeat(32));
        assert!(WireGuardConfig::from_uapi(&text).is_err());

        // Missing endpoint
        let text = format!("private_key={}\npublic_key={}\n", "aa".repeat(32), "bb".repeat(32));
        assert!(matches!(
            WireGuardConfig::from_uapi(&text),
            Err(Error::MissingDeviceConfig("endpoint"))
        ));
    }

    #[test]
    fn test_packet_addresses() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&[100, 127, 10, 2]);
        packet[16..20].copy_from_slice(&[100, 127, 69, 42]);

        assert_eq!(packet_source(&packet), Some("100.127.10.2".parse().unwrap()));
        assert_eq!(packet_destination(&packet), Some("100.127.69.42".parse().unwrap()));
        assert_eq!(packet_destination(&packet[..10]), None);
        assert_eq!(packet_destination(&[]), None);
    }
}
