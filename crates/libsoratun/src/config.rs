//! Session descriptor parsing.
//!
//! The descriptor is deserialized into raw string fields first and each one
//! is then decoded by its own parser ([`Key`], [`Endpoint`], [`RoutingPrefix`]).
//! A failing field is reported with its JSON path.

use crate::error::ParseError;
use crate::DEFAULT_ENDPOINT_PORT;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use ipnet::IpNet;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Length of a WireGuard key in bytes.
pub const KEY_LEN: usize = 32;

/// A WireGuard key, written as standard base64 in the descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex form, as the engine configuration expects.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Key {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_STANDARD
            .decode(s)
            .map_err(|e| ParseError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            ParseError::InvalidKey(format!(
                "incorrect key size: {}, expected {}",
                bytes.len(),
                KEY_LEN
            ))
        })?;
        Ok(Self(bytes))
    }
}

/// Base64 form of the key.
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64_STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

/// The server's UDP endpoint, resolved at parse time.
///
/// The original text is kept alongside the resolved address for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    ip: Option<IpAddr>,
    port: u16,
    raw: String,
}

impl Endpoint {
    /// Parse `host:port`, `[v6]:port` or a bare host with the default port.
    ///
    /// Hostnames are resolved with the system resolver and the first address
    /// returned is used.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let default_port = DEFAULT_ENDPOINT_PORT.to_string();
        let (host, port) = split_host_port(text).unwrap_or((text, default_port.as_str()));
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port: u16 = port
            .parse()
            .map_err(|_| ParseError::InvalidPort(port.to_string()))?;

        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => lookup_first(host, port)?,
        };

        Ok(Self {
            ip: Some(ip),
            port,
            raw: text.to_string(),
        })
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The endpoint exactly as written in the descriptor.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

/// `ip:port` for IPv4 (including IPv4-mapped IPv6), `[ip]:port` for IPv6,
/// and an empty string when no address was resolved.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Some(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => write!(f, "{}:{}", v4, self.port),
                None => write!(f, "[{}]:{}", ip, self.port),
            },
            None => Ok(()),
        }
    }
}

/// Split `host:port` on the last colon.
///
/// Returns `None` when there is no port separator or when an unbracketed
/// host contains further colons.
pub(crate) fn split_host_port(text: &str) -> Option<(&str, &str)> {
    if text.starts_with('[') {
        let end = text.find(']')?;
        let port = text[end + 1..].strip_prefix(':')?;
        return Some((&text[..=end], port));
    }

    let (host, port) = text.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

fn lookup_first(host: &str, port: u16) -> Result<IpAddr, ParseError> {
    let invalid = |message: String| ParseError::InvalidEndpoint {
        host: host.to_string(),
        message,
    };

    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?;
    let addr = addrs
        .next()
        .ok_or_else(|| invalid("no addresses found".to_string()))?;

    log::debug!("Resolved endpoint {} -> {}", host, addr.ip());
    Ok(addr.ip())
}

/// A CIDR routing prefix with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingPrefix(IpNet);

impl RoutingPrefix {
    pub fn net(&self) -> IpNet {
        self.0
    }
}

impl FromStr for RoutingPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net: IpNet = s
            .parse()
            .map_err(|_| ParseError::InvalidPrefix(s.to_string()))?;
        Ok(Self(net.trunc()))
    }
}

impl fmt::Display for RoutingPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Logging verbosity requested by the descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    #[default]
    Silent,
    Error,
    Verbose,
}

impl LogLevel {
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Silent => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Verbose => log::LevelFilter::Debug,
        }
    }

    pub fn is_verbose(self) -> bool {
        self == LogLevel::Verbose
    }
}

impl From<i64> for LogLevel {
    fn from(level: i64) -> Self {
        match level {
            i64::MIN..=0 => LogLevel::Silent,
            1 => LogLevel::Error,
            _ => LogLevel::Verbose,
        }
    }
}

/// A parsed session descriptor.
#[derive(Debug, Clone)]
pub struct Session {
    pub private_key: Key,
    pub arc_session: Option<ArcSession>,
    pub log_level: LogLevel,
}

/// Connection details issued by the SORACOM Arc server.
#[derive(Debug, Clone)]
pub struct ArcSession {
    pub server_peer_public_key: Key,
    pub server_endpoint: Endpoint,
    pub allowed_ips: Vec<RoutingPrefix>,
    /// Accepted for compatibility; tunnel setup does not use it.
    pub client_peer_private_key: Option<Key>,
    pub client_peer_ip_address: Option<IpAddr>,
}

/// wg-quick style summary with the private key masked.
impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        if let Some(ip) = self
            .arc_session
            .as_ref()
            .and_then(|arc| arc.client_peer_ip_address)
        {
            writeln!(f, "Address = {}/32", ip)?;
        }
        writeln!(f, "PrivateKey = <secret>")?;

        let Some(arc) = &self.arc_session else {
            return Ok(());
        };
        let allowed_ips: Vec<String> = arc.allowed_ips.iter().map(|p| p.to_string()).collect();

        writeln!(f)?;
        writeln!(f, "[Peer]")?;
        writeln!(f, "PublicKey = {}", arc.server_peer_public_key.to_hex())?;
        writeln!(f, "AllowedIPs = {}", allowed_ips.join(", "))?;
        writeln!(f, "Endpoint = {}", arc.server_endpoint)
    }
}

impl FromStr for Session {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_configuration(s.as_bytes())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSession {
    private_key: String,
    #[serde(default)]
    arc_session_status: Option<RawArcSession>,
    #[serde(default)]
    log_level: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArcSession {
    arc_server_peer_public_key: String,
    arc_server_endpoint: String,
    #[serde(default, rename = "arcAllowedIPs")]
    arc_allowed_ips: Vec<String>,
    #[serde(default)]
    arc_client_peer_private_key: Option<String>,
    #[serde(default)]
    arc_client_peer_ip_address: Option<String>,
}

/// Parse a session descriptor from JSON.
pub fn parse_configuration(json: &[u8]) -> Result<Session, ParseError> {
    let raw: RawSession = serde_json::from_slice(json)?;

    let private_key = raw
        .private_key
        .parse::<Key>()
        .map_err(|e: ParseError| e.in_field("privateKey"))?;

    let arc_session = raw.arc_session_status.map(parse_arc_session).transpose()?;

    Ok(Session {
        private_key,
        arc_session,
        log_level: LogLevel::from(raw.log_level),
    })
}

fn parse_arc_session(raw: RawArcSession) -> Result<ArcSession, ParseError> {
    let field = |name: &str| format!("arcSessionStatus.{}", name);

    let server_peer_public_key = raw
        .arc_server_peer_public_key
        .parse::<Key>()
        .map_err(|e: ParseError| e.in_field(field("arcServerPeerPublicKey")))?;

    let server_endpoint = Endpoint::parse(&raw.arc_server_endpoint)
        .map_err(|e| e.in_field(field("arcServerEndpoint")))?;

    let allowed_ips = raw
        .arc_allowed_ips
        .iter()
        .enumerate()
        .map(|(i, prefix)| {
            prefix
                .parse::<RoutingPrefix>()
                .map_err(|e: ParseError| e.in_field(field(&format!("arcAllowedIPs[{}]", i))))
        })
        .collect::<Result<Vec<RoutingPrefix>, _>>()?;

    let client_peer_private_key = raw
        .arc_client_peer_private_key
        .filter(|key| !key.is_empty())
        .map(|key| key.parse::<Key>())
        .transpose()
        .map_err(|e| e.in_field(field("arcClientPeerPrivateKey")))?;

    let client_peer_ip_address = raw
        .arc_client_peer_ip_address
        .filter(|ip| !ip.is_empty())
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|_| ParseError::InvalidAddress(ip.clone()))
        })
        .transpose()
        .map_err(|e| e.in_field(field("arcClientPeerIpAddress")))?;

    Ok(ArcSession {
        server_peer_public_key,
        server_endpoint,
        allowed_ips,
        client_peer_private_key,
        client_peer_ip_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PUBLIC_KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    fn descriptor(arc: &str) -> String {
        format!(
            r#"{{"privateKey":"{}","arcSessionStatus":{},"logLevel":2}}"#,
            PRIVATE_KEY, arc
        )
    }

    fn arc(endpoint: &str, allowed: &str) -> String {
        format!(
            r#"{{"arcServerPeerPublicKey":"{}","arcServerEndpoint":"{}","arcAllowedIPs":{},"arcClientPeerIpAddress":"10.0.0.2"}}"#,
            PUBLIC_KEY, endpoint, allowed
        )
    }

    #[test]
    fn test_key_round_trip() {
        let key: Key = PRIVATE_KEY.parse().unwrap();
        assert_eq!(key.to_string(), PRIVATE_KEY);
        assert_eq!(key.to_hex().len(), 64);
        assert_eq!(hex::decode(key.to_hex()).unwrap(), key.as_bytes());
        assert_eq!(format!("{:?}", key), "Key(..)");
    }

    #[test]
    fn test_key_rejects_bad_input() {
        assert!(matches!("not base64!".parse::<Key>(), Err(ParseError::InvalidKey(_))));
        // 16 bytes of valid base64
        assert!(matches!(
            "AAAAAAAAAAAAAAAAAAAAAA==".parse::<Key>(),
            Err(ParseError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("10.0.0.1:9999").unwrap();
        assert_eq!(endpoint.ip(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(endpoint.port(), 9999);
        assert_eq!(endpoint.raw(), "10.0.0.1:9999");
        assert_eq!(endpoint.to_string(), "10.0.0.1:9999");

        let endpoint = Endpoint::parse("10.0.0.1").unwrap();
        assert_eq!(endpoint.port(), DEFAULT_ENDPOINT_PORT);
        assert_eq!(endpoint.to_string(), "10.0.0.1:11010");

        let endpoint = Endpoint::parse("[2001:db8::1]:51820").unwrap();
        assert_eq!(endpoint.to_string(), "[2001:db8::1]:51820");

        let endpoint = Endpoint::parse("2001:db8::1").unwrap();
        assert_eq!(endpoint.port(), DEFAULT_ENDPOINT_PORT);

        let endpoint = Endpoint::parse("[::ffff:192.0.2.1]:80").unwrap();
        assert_eq!(endpoint.to_string(), "192.0.2.1:80");

        assert_eq!(Endpoint::default().to_string(), "");
    }

    #[test]
    fn test_endpoint_rejects_bad_port() {
        assert!(matches!(
            Endpoint::parse("host:99999"),
            Err(ParseError::InvalidPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("10.0.0.1:"),
            Err(ParseError::InvalidPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("10.0.0.1:-1"),
            Err(ParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_routing_prefix() {
        let prefix: RoutingPrefix = "10.0.0.0/8".parse().unwrap();
        assert_eq!(prefix.to_string(), "10.0.0.0/8");

        let prefix: RoutingPrefix = "100.127.10.5/16".parse().unwrap();
        assert_eq!(prefix.to_string(), "100.127.0.0/16");

        assert!(matches!(
            "not-a-cidr".parse::<RoutingPrefix>(),
            Err(ParseError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_log_level() {
        assert_eq!(LogLevel::from(0), LogLevel::Silent);
        assert_eq!(LogLevel::from(-3), LogLevel::Silent);
        assert_eq!(LogLevel::from(1), LogLevel::Error);
        assert_eq!(LogLevel::from(2), LogLevel::Verbose);
        assert_eq!(LogLevel::from(7), LogLevel::Verbose);
        assert_eq!(LogLevel::Error.level_filter(), log::LevelFilter::Error);
        assert!(LogLevel::Verbose.is_verbose());
    }

    #[test]
    fn test_parse_configuration() {
        let json = descriptor(&arc("192.0.2.10:11010", r#"["100.127.0.0/16","10.0.0.0/8"]"#));
        let session = parse_configuration(json.as_bytes()).unwrap();

        assert_eq!(session.private_key.to_string(), PRIVATE_KEY);
        assert_eq!(session.log_level, LogLevel::Verbose);

        let arc = session.arc_session.as_ref().unwrap();
        assert_eq!(arc.server_peer_public_key.to_string(), PUBLIC_KEY);
        assert_eq!(arc.server_endpoint.to_string(), "192.0.2.10:11010");
        assert_eq!(arc.allowed_ips.len(), 2);
        assert_eq!(arc.allowed_ips[1].to_string(), "10.0.0.0/8");
        assert!(arc.client_peer_private_key.is_none());
        assert_eq!(arc.client_peer_ip_address, Some("10.0.0.2".parse().unwrap()));

        let summary = session.to_string();
        assert!(summary.contains("Address = 10.0.0.2/32"));
        assert!(summary.contains("PrivateKey = <secret>"));
        assert!(summary.contains("AllowedIPs = 100.127.0.0/16, 10.0.0.0/8"));
        assert!(summary.contains("Endpoint = 192.0.2.10:11010"));
        assert!(!summary.contains(PRIVATE_KEY));
        assert!(!summary.contains(&session.private_key.to_hex()));
    }

    #[test]
    fn test_parse_configuration_without_session() {
        let json = format!(r#"{{"privateKey":"{}"}}"#, PRIVATE_KEY);
        let session = parse_configuration(json.as_bytes()).unwrap();
        assert!(session.arc_session.is_none());
        assert_eq!(session.log_level, LogLevel::Silent);
    }

    #[test]
    fn test_parse_configuration_names_failing_field() {
        let json = descriptor(&arc("192.0.2.10:99999", "[]"));
        let err = parse_configuration(json.as_bytes()).unwrap_err();
        assert!(matches!(
            &err,
            ParseError::Field { field, .. } if field == "arcSessionStatus.arcServerEndpoint"
        ));
        assert!(matches!(err.root(), ParseError::InvalidPort(_)));

        let json = descriptor(&arc("192.0.2.10", r#"["10.0.0.0/8","bogus"]"#));
        let err = parse_configuration(json.as_bytes()).unwrap_err();
        assert!(matches!(
            &err,
            ParseError::Field { field, .. } if field == "arcSessionStatus.arcAllowedIPs[1]"
        ));

        let json = r#"{"privateKey":"short"}"#;
        let err = parse_configuration(json.as_bytes()).unwrap_err();
        assert!(matches!(&err, ParseError::Field { field, .. } if field == "privateKey"));

        assert!(matches!(
            parse_configuration(b"{not json"),
            Err(ParseError::Json(_))
        ));
    }

    #[test]
    fn test_empty_client_address_is_absent() {
        let arc = format!(
            r#"{{"arcServerPeerPublicKey":"{}","arcServerEndpoint":"192.0.2.10","arcClientPeerIpAddress":"","arcClientPeerPrivateKey":"{}"}}"#,
            PUBLIC_KEY, PRIVATE_KEY
        );
        let session = parse_configuration(descriptor(&arc).as_bytes()).unwrap();
        let arc = session.arc_session.unwrap();
        assert!(arc.client_peer_ip_address.is_none());
        assert!(arc.allowed_ips.is_empty());
        assert_eq!(arc.client_peer_private_key.unwrap().to_string(), PRIVATE_KEY);
    }
}
