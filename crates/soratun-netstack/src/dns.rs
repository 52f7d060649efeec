//! Plain DNS resolver that queries servers inside the tunnel.
//!
//! Queries are sent as UDP datagrams on port 53 through the [`NetStack`], so
//! names are looked up by the resolvers the tunnel peer exposes. Only A
//! records are requested because the virtual interface is IPv4-only.

use crate::error::{Error, Result};
use crate::netstack::{NetStack, UdpConnection};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for a single DNS query.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest DNS response accepted over UDP.
const MAX_RESPONSE_SIZE: usize = 1232;

/// Resolves hostnames through DNS servers reachable over the tunnel.
#[derive(Clone)]
pub struct TunnelResolver {
    netstack: Arc<NetStack>,
    servers: Vec<Ipv4Addr>,
}

impl TunnelResolver {
    /// Use the DNS servers registered on the network stack.
    pub fn new(netstack: Arc<NetStack>) -> Self {
        let servers = netstack.dns_servers().to_vec();
        Self { netstack, servers }
    }

    /// Servers queried by this resolver.
    pub fn servers(&self) -> &[Ipv4Addr] {
        &self.servers
    }

    /// Resolve a hostname. IP literals are returned as-is without a query.
    ///
    /// Fails with [`Error::NetStackClosed`] once the stack has been closed.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        self.netstack.ensure_open()?;

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        log::debug!("Resolving {} via tunnel DNS", hostname);

        let mut last_error = None;
        for server in &self.servers {
            match self.query(*server, hostname).await {
                Ok(addrs) => return Ok(addrs.into_iter().map(IpAddr::V4).collect()),
                Err(e) => {
                    log::warn!("DNS query to {} failed: {}", server, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::DnsAllServersFailed(hostname.to_string())))
    }

    /// Resolve a hostname to a single socket address.
    pub async fn resolve_addr(&self, hostname: &str, port: u16) -> Result<SocketAddr> {
        let addrs = self.resolve(hostname).await?;
        let ip = addrs
            .into_iter()
            .next()
            .ok_or_else(|| Error::DnsNoRecords(hostname.to_string()))?;
        Ok(SocketAddr::new(ip, port))
    }

    async fn query(&self, server: Ipv4Addr, hostname: &str) -> Result<Vec<Ipv4Addr>> {
        let (id, query) = build_dns_query(hostname)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(server, 53));
        let conn = UdpConnection::connect(self.netstack.clone(), addr)?;

        conn.send(&query).await?;

        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        let n = tokio::time::timeout(QUERY_TIMEOUT, conn.recv(&mut buf))
            .await
            .map_err(|_| Error::DnsTimeout)??;

        parse_dns_response(&buf[..n], id, hostname)
    }
}

/// Build a DNS query in wire format, returning the transaction ID with it.
fn build_dns_query(hostname: &str) -> Result<(u16, Vec<u8>)> {
    let mut query = Vec::new();

    // Transaction ID (random)
    let id: u16 = rand::random();
    query.extend_from_slice(&id.to_be_bytes());

    // Flags: standard query, recursion desired
    query.extend_from_slice(&[0x01, 0x00]);

    // QDCOUNT = 1, ANCOUNT = NSCOUNT = ARCOUNT = 0
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in hostname.trim_end_matches('.').split('.') {
        if label.len() > 63 {
            return Err(Error::DnsLabelTooLong(label.to_string()));
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0); // Root label

    // QTYPE = A, QCLASS = IN
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

    Ok((id, query))
}

/// Parse DNS response wire format.
fn parse_dns_response(data: &[u8], id: u16, hostname: &str) -> Result<Vec<Ipv4Addr>> {
    if data.len() < 12 {
        return Err(Error::DnsResponseTooShort);
    }

    if u16::from_be_bytes([data[0], data[1]]) != id {
        return Err(Error::DnsIdMismatch);
    }

    let flags = u16::from_be_bytes([data[2], data[3]]);
    let rcode = flags & 0x000F;

    if rcode != 0 {
        return Err(Error::DnsError(rcode));
    }

    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;
    if ancount == 0 {
        return Err(Error::DnsNoRecords(hostname.to_string()));
    }

    log::debug!("DNS response has {} answers", ancount);

    let mut pos = 12;

    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    for _ in 0..qdcount {
        pos = skip_dns_name(data, pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    let mut addresses = Vec::new();
    for _ in 0..ancount {
        if pos >= data.len() {
            break;
        }

        pos = skip_dns_name(data, pos)?;

        if pos + 10 > data.len() {
            break;
        }

        let rtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let rdlength = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as usize;

        pos += 10;

        if pos + rdlength > data.len() {
            break;
        }

        // Type A = 1
        if rtype == 1 && rdlength == 4 {
            let ip = Ipv4Addr::new(data[pos], data[pos + 1], data[pos + 2], data[pos + 3]);
            log::debug!("Resolved {} -> {}", hostname, ip);
            addresses.push(ip);
        }

        pos += rdlength;
    }

    if addresses.is_empty() {
        return Err(Error::DnsNoRecords(hostname.to_string()));
    }

    Ok(addresses)
}

/// Skip a DNS name (handles compression).
fn skip_dns_name(data: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        if pos >= data.len() {
            return Err(Error::DnsNameTooLong);
        }

        let len = data[pos] as usize;

        // Compression pointer is 2 bytes
        if len & 0xC0 == 0xC0 {
            return Ok(pos + 2);
        }

        if len == 0 {
            return Ok(pos + 1);
        }

        pos += 1 + len;
    }
}
