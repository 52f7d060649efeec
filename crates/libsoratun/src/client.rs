//! HTTP client for the Unified Endpoint.
//!
//! Requests are validated before anything is sent, carry a fixed
//! `User-Agent`, and go to the Unified Endpoint's virtual address over the
//! tunnel. Responses with status 400 or above are turned into
//! [`Error::Status`] after their body has been drained.

use crate::config::{LogLevel, Session};
use crate::connector::TunnelConnector;
use crate::error::{Error, Result, ValidationError};
use crate::tunnel::{Dialer, Tunnel};
use crate::{REVISION, UNIFIED_ENDPOINT_HOST, UNIFIED_ENDPOINT_HTTP_PORT};
use bytes::Bytes;
use http::header::{HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::fmt::Write as _;
use std::sync::Arc;

/// Body of a response returned by [`UnifiedEndpointHttpClient::do_request`].
pub type ResponseBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Per-client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Reported as `User-Agent: libsoratun/<revision>`.
    pub revision: String,
    /// `Verbose` dumps every request and response at debug level.
    pub log_level: LogLevel,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            revision: REVISION.to_string(),
            log_level: LogLevel::Silent,
        }
    }
}

impl ClientOptions {
    /// Default options with the session's log level.
    pub fn for_session(session: &Session) -> Self {
        Self {
            log_level: session.log_level,
            ..Self::default()
        }
    }
}

/// HTTP client bound to the Unified Endpoint.
pub struct UnifiedEndpointHttpClient<D: Dialer = Tunnel> {
    client: Client<TunnelConnector<D>, Full<Bytes>>,
    endpoint: String,
    user_agent: HeaderValue,
    log_level: LogLevel,
}

impl<D: Dialer> UnifiedEndpointHttpClient<D> {
    pub fn new(dialer: Arc<D>, options: ClientOptions) -> Result<Self> {
        let endpoint = format!(
            "http://{}:{}",
            UNIFIED_ENDPOINT_HOST, UNIFIED_ENDPOINT_HTTP_PORT
        );
        let user_agent = HeaderValue::try_from(format!("libsoratun/{}", options.revision))
            .map_err(http::Error::from)?;

        log::debug!("Unified Endpoint URL: {}", endpoint);
        log::debug!("User-Agent: {:?}", user_agent);

        // One request per tunnel, so never keep connections around
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(TunnelConnector::new(dialer));

        Ok(Self {
            client,
            endpoint,
            user_agent,
            log_level: options.log_level,
        })
    }

    /// Validate the inputs and build a request.
    ///
    /// `method` is trimmed and matched case-insensitively against GET and
    /// POST. One leading slash is removed from `path`, which must then be
    /// non-empty. `body` must be non-empty. Checks run in that order.
    pub fn make_request(&self, method: &str, path: &str, body: &str) -> Result<Request<Full<Bytes>>> {
        let (method, path) = validate_request(method, path, body)?;

        let request = Request::builder()
            .method(method)
            .uri(format!("{}/{}", self.endpoint, path))
            .header(USER_AGENT, self.user_agent.clone())
            .body(Full::new(Bytes::from(body.to_string())))?;

        if self.log_level.is_verbose() {
            log::debug!(
                "Sent HTTP request:\n{}",
                dump_message(
                    &format!("{} {} {:?}", request.method(), request.uri(), request.version()),
                    request.headers(),
                    body.as_bytes()
                )
            );
        }

        Ok(request)
    }

    /// Send a request and return the response with its body unread.
    pub async fn do_request(&self, request: Request<Full<Bytes>>) -> Result<Response<ResponseBody>> {
        let method = request.method().clone();
        let url = request.uri().clone();

        let response = self.client.request(request).await?;
        let (parts, body) = response.into_parts();

        let body = if self.log_level.is_verbose() {
            let bytes = body.collect().await?.to_bytes();
            log::debug!(
                "Received HTTP response:\n{}",
                dump_message(
                    &format!("{:?} {}", parts.version, parts.status),
                    &parts.headers,
                    &bytes
                )
            );
            Full::new(bytes)
                .map_err(|never| match never {})
                .boxed_unsync()
        } else {
            body.boxed_unsync()
        };

        if parts.status.as_u16() >= 400 {
            let bytes = body.collect().await?.to_bytes();
            let err = Error::Status {
                status: parts.status,
                method,
                url,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            };
            log::error!("{}", err);
            return Err(err);
        }

        Ok(Response::from_parts(parts, body))
    }

    /// Build, send and read one request, returning the response body as text.
    pub async fn send(&self, method: &str, path: &str, body: &str) -> Result<String> {
        let request = self.make_request(method, path, body)?;
        let response = self.do_request(request).await?;
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Check a request's shape, returning the normalized method and the path
/// without its leading slash.
pub fn validate_request<'a>(
    method: &str,
    path: &'a str,
    body: &str,
) -> std::result::Result<(Method, &'a str), ValidationError> {
    let method = match method.trim().to_ascii_uppercase().as_str() {
        "GET" => Method::GET,
        "POST" => Method::POST,
        _ => return Err(ValidationError::UnsupportedMethod(method.to_string())),
    };

    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return Err(ValidationError::PathRequired);
    }

    if body.is_empty() {
        return Err(ValidationError::BodyRequired);
    }

    Ok((method, path))
}

fn dump_message(start_line: &str, headers: &HeaderMap, body: &[u8]) -> String {
    let mut out = format!("{}\r\n", start_line);
    for (name, value) in headers {
        let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(body));
    out
}
