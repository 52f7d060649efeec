//! UDP client for the Unified Endpoint.

use crate::error::{Error, NetworkStage, Result};
use crate::tunnel::{DatagramSocket, Dialer, Tunnel};
use crate::UNIFIED_ENDPOINT_HOST;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Size of the reply buffer. Longer replies are truncated.
pub const REPLY_BUFFER_SIZE: usize = 1024;

/// Default time to wait for a reply.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends one datagram to the Unified Endpoint and reads one reply.
pub struct UnifiedEndpointUdpClient<D: Dialer = Tunnel> {
    dialer: Arc<D>,
    read_timeout: Option<Duration>,
}

impl<D: Dialer> UnifiedEndpointUdpClient<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self {
            dialer,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
        }
    }

    /// Set how long to wait for the reply. `None` waits indefinitely.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Send `body` to the Unified Endpoint on `port` and return the reply as text.
    ///
    /// Exactly one read is made into a [`REPLY_BUFFER_SIZE`] buffer. The
    /// association is released when this returns.
    pub async fn send_datagram(&self, body: &[u8], port: u16) -> Result<String> {
        let address = format!("{}:{}", UNIFIED_ENDPOINT_HOST, port);

        let socket = self
            .dialer
            .dial_datagram(&address)
            .await
            .map_err(|e| Error::network(NetworkStage::Dial)(e.into()))?;

        let sent = socket.send(body).await.map_err(|e| {
            log::error!("Failed to write UDP datagram: {}", e);
            Error::network(NetworkStage::Write)(e)
        })?;
        log::debug!("UDP sent {} bytes", sent);

        let mut reply = [0u8; REPLY_BUFFER_SIZE];
        let received = match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, socket.recv(&mut reply))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reply within {:?}", timeout),
                    ))
                }),
            None => socket.recv(&mut reply).await,
        }
        .map_err(Error::network(NetworkStage::Read))?;
        log::debug!("UDP received {} bytes", received);

        Ok(String::from_utf8_lossy(&reply[..received]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::future::Future;
    use std::net::SocketAddr;
    use tokio::io::DuplexStream;
    use tokio::net::UdpSocket;

    struct LoopbackSocket(UdpSocket);

    impl DatagramSocket for LoopbackSocket {
        fn send<'a>(
            &'a self,
            data: &'a [u8],
        ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
            self.0.send(data)
        }

        fn recv<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
            self.0.recv(buf)
        }
    }

    /// Connects every datagram dial to a local server, whatever the address.
    struct LoopbackDialer {
        server: Option<SocketAddr>,
        addresses: Mutex<Vec<String>>,
    }

    impl LoopbackDialer {
        fn new(server: Option<SocketAddr>) -> Arc<Self> {
            Arc::new(Self {
                server,
                addresses: Mutex::new(Vec::new()),
            })
        }
    }

    impl Dialer for LoopbackDialer {
        type Stream = DuplexStream;
        type Datagram = LoopbackSocket;

        fn dial_stream<'a>(
            &'a self,
            address: &'a str,
        ) -> impl Future<Output = Result<Self::Stream>> + Send + 'a {
            async move { Err(Error::UnsupportedNetwork(format!("tcp {}", address))) }
        }

        fn dial_datagram<'a>(
            &'a self,
            address: &'a str,
        ) -> impl Future<Output = Result<Self::Datagram>> + Send + 'a {
            async move {
                self.addresses.lock().push(address.to_string());
                let server = self
                    .server
                    .ok_or(soratun_netstack::Error::NetStackClosed)?;
                let socket = UdpSocket::bind("127.0.0.1:0").await?;
                socket.connect(server).await?;
                Ok(LoopbackSocket(socket))
            }
        }
    }

    async fn server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_send_datagram() {
        let (server, addr) = server().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let reply = format!("ack:{}", String::from_utf8_lossy(&buf[..n]));
            server.send_to(reply.as_bytes(), from).await.unwrap();
        });

        let dialer = LoopbackDialer::new(Some(addr));
        let client = UnifiedEndpointUdpClient::new(dialer.clone());

        let reply = client.send_datagram(b"hello", 23080).await.unwrap();
        assert_eq!(reply, "ack:hello");
        assert_eq!(dialer.addresses.lock().as_slice(), ["100.127.69.42:23080"]);
    }

    #[tokio::test]
    async fn test_long_reply_is_truncated() {
        let (server, addr) = server().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&[b'x'; 1500], from).await.unwrap();
        });

        let client = UnifiedEndpointUdpClient::new(LoopbackDialer::new(Some(addr)));
        let reply = client.send_datagram(b"big", 23080).await.unwrap();
        assert_eq!(reply.len(), REPLY_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_server, addr) = server().await;

        let client = UnifiedEndpointUdpClient::new(LoopbackDialer::new(Some(addr)))
            .with_read_timeout(Some(Duration::from_millis(50)));
        let err = client.send_datagram(b"hello", 23080).await.unwrap_err();

        match err {
            Error::Network {
                stage: NetworkStage::Read,
                source,
            } => assert_eq!(source.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let client = UnifiedEndpointUdpClient::new(LoopbackDialer::new(None));
        let err = client.send_datagram(b"hello", 23080).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Network {
                stage: NetworkStage::Dial,
                ..
            }
        ));
    }
}
