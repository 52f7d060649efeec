//! Error types for libsoratun.

use std::fmt;

/// Result type alias for libsoratun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid session descriptor input.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("error while reading config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid endpoint \"{host}\": {message}")]
    InvalidEndpoint { host: String, message: String },

    #[error("invalid port number: {0}, it should be a 16-bit unsigned integer")]
    InvalidPort(String),

    #[error("invalid CIDR \"{0}\"")]
    InvalidPrefix(String),

    #[error("invalid IP address \"{0}\"")]
    InvalidAddress(String),

    #[error("{field}: {source}")]
    Field {
        field: String,
        source: Box<ParseError>,
    },
}

impl ParseError {
    /// Attach the JSON path of the field that failed to parse.
    pub(crate) fn in_field(self, field: impl Into<String>) -> Self {
        ParseError::Field {
            field: field.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping field context.
    pub fn root(&self) -> &ParseError {
        match self {
            ParseError::Field { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Request shape rejected before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported method \"{0}\": only GET or POST is supported")]
    UnsupportedMethod(String),

    #[error("path is required")]
    PathRequired,

    #[error("body is required")]
    BodyRequired,
}

/// Step of tunnel setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStage {
    Create,
    Configure,
    Activate,
}

impl fmt::Display for TunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TunnelStage::Create => "create",
            TunnelStage::Configure => "configure",
            TunnelStage::Activate => "activate",
        })
    }
}

/// Step of a UDP exchange that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    Dial,
    Write,
    Read,
}

impl fmt::Display for NetworkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkStage::Dial => "dial",
            NetworkStage::Write => "write",
            NetworkStage::Read => "read",
        })
    }
}

/// Errors that can occur in libsoratun.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse config: {0}")]
    Parse(#[from] ParseError),

    #[error("config has no arcSessionStatus")]
    MissingSession,

    #[error("failed to {stage} tunnel: {source}")]
    Tunnel {
        stage: TunnelStage,
        source: soratun_netstack::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{status}: {method} {url}: {body}")]
    Status {
        status: http::StatusCode,
        method: http::Method,
        url: http::Uri,
        body: String,
    },

    #[error("HTTP request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("invalid HTTP request: {0}")]
    Http(#[from] http::Error),

    #[error("URI has no host: {0}")]
    NoHost(String),

    #[error("UDP {stage} failed: {source}")]
    Network {
        stage: NetworkStage,
        source: std::io::Error,
    },

    #[error("dial failed: {0}")]
    Dial(#[from] soratun_netstack::Error),

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn tunnel(stage: TunnelStage) -> impl FnOnce(soratun_netstack::Error) -> Self {
        move |source| Error::Tunnel { stage, source }
    }

    pub(crate) fn network(stage: NetworkStage) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Error::Network { stage, source }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::Dial(e) => e.into(),
            Error::Network { source, .. } => source,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display() {
        let err = Error::Status {
            status: http::StatusCode::NOT_FOUND,
            method: http::Method::POST,
            url: "http://100.127.69.42:80/v1/status".parse().unwrap(),
            body: "not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "404 Not Found: POST http://100.127.69.42:80/v1/status: not found"
        );
    }

    #[test]
    fn test_field_error_root() {
        let err = ParseError::InvalidPort("99999".into()).in_field("arcSessionStatus.arcServerEndpoint");
        assert!(matches!(err.root(), ParseError::InvalidPort(_)));
        assert!(err.to_string().starts_with("arcSessionStatus.arcServerEndpoint: invalid port"));
    }

    #[test]
    fn test_tunnel_error_display() {
        let err = Error::tunnel(TunnelStage::Activate)(soratun_netstack::Error::TunnelCreation(
            "bind failed".into(),
        ));
        assert_eq!(
            err.to_string(),
            "failed to activate tunnel: Failed to create WireGuard tunnel: bind failed"
        );
    }
}
