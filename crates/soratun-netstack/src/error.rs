//! Error types for soratun-netstack.

use std::net::SocketAddr;

/// Result type alias for soratun-netstack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in soratun-netstack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid device configuration at line {line}: {message}")]
    DeviceConfig { line: usize, message: String },

    #[error("Device configuration is missing '{0}'")]
    MissingDeviceConfig(&'static str),

    #[error("Device has not been configured")]
    NotConfigured,

    #[error("Device is already up or closed")]
    DeviceUnavailable,

    #[error("Invalid hex key: {0}")]
    InvalidKey(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid MTU: {0}")]
    InvalidMtu(usize),

    #[error("Interface setup failed: {0}")]
    Interface(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("All DNS servers failed for '{0}'")]
    DnsAllServersFailed(String),

    #[error("No DNS records found for '{0}'")]
    DnsNoRecords(String),

    #[error("DNS error: RCODE={0}")]
    DnsError(u16),

    #[error("DNS response too short")]
    DnsResponseTooShort,

    #[error("DNS response ID does not match the query")]
    DnsIdMismatch,

    #[error("DNS name extends beyond packet")]
    DnsNameTooLong,

    #[error("DNS label too long: {0}")]
    DnsLabelTooLong(String),

    #[error("DNS query timeout")]
    DnsTimeout,

    #[error("WireGuard handshake timeout after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("Failed to create WireGuard tunnel: {0}")]
    TunnelCreation(String),

    #[error("TCP connection to {addr} failed: {message}")]
    TcpConnect { addr: SocketAddr, message: String },

    #[error("TCP connection failed: {0}")]
    TcpConnectGeneric(String),

    #[error("TCP connection timeout")]
    TcpTimeout,

    #[error("TCP send failed: {0}")]
    TcpSend(String),

    #[error("TCP receive failed: {0}")]
    TcpRecv(String),

    #[error("UDP bind failed: {0}")]
    UdpBind(String),

    #[error("UDP send failed: {0}")]
    UdpSend(String),

    #[error("UDP receive failed: {0}")]
    UdpRecv(String),

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Network stack is closed")]
    NetStackClosed,

    #[error("IPv6 not supported")]
    Ipv6NotSupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;

        match e {
            Error::Io(e) => e,
            Error::WriteTimeout | Error::TcpTimeout | Error::DnsTimeout => {
                std::io::Error::new(ErrorKind::TimedOut, e)
            }
            Error::ConnectionClosed | Error::NetStackClosed => {
                std::io::Error::new(ErrorKind::BrokenPipe, e)
            }
            other => std::io::Error::new(ErrorKind::Other, other),
        }
    }
}
