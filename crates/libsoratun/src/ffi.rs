//! Foreign function interface for host applications.
//!
//! Exports `Send`, `SendUDP` and `FreeString` with C linkage. Each call parses
//! its own session descriptor, brings up a private tunnel on a dedicated
//! runtime, performs one exchange, and tears everything down before
//! returning.
//!
//! ## Memory Safety
//!
//! - All strings are null-terminated C strings
//! - Strings returned by `Send` and `SendUDP` are owned by the caller and must
//!   be released with `FreeString`
//! - `Send` reports errors as NULL; details go to the log
//!
//! ## Logging
//!
//! The logger and its maximum level are process-wide. Each call applies its
//! session's `logLevel`, so concurrent calls with different levels share
//! whichever level was set last.

use crate::client::{validate_request, ClientOptions, UnifiedEndpointHttpClient};
use crate::config::{parse_configuration, LogLevel, Session};
use crate::error::{Error, NetworkStage, Result};
use crate::tunnel::{Tunnel, TunnelOptions};
use crate::udp::UnifiedEndpointUdpClient;
use crate::UNIFIED_ENDPOINT_UDP_PORT;
use std::ffi::{CStr, CString};
use std::future::Future;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::Arc;

/// Perform one HTTP exchange with the Unified Endpoint and return the response body.
pub fn send(config_json: &str, method: &str, path: &str, body: &str) -> Result<String> {
    let session = load_session(config_json)?;
    validate_request(method, path, body)?;

    let options = ClientOptions::for_session(&session);

    with_tunnel(&session, |tunnel| async move {
        let client = UnifiedEndpointHttpClient::new(tunnel, options)?;
        client.send(method, path, body).await
    })
}

/// Send one datagram to the Unified Endpoint's UDP port and return the reply.
pub fn send_udp(config_json: &str, body: &[u8]) -> Result<String> {
    let session = load_session(config_json)?;

    with_tunnel(&session, |tunnel| async move {
        UnifiedEndpointUdpClient::new(tunnel)
            .send_datagram(body, UNIFIED_ENDPOINT_UDP_PORT)
            .await
    })
}

fn load_session(config_json: &str) -> Result<Session> {
    let session = parse_configuration(config_json.as_bytes())?;
    init_logging(session.log_level);
    Ok(session)
}

/// Run `f` against a fresh tunnel on a current-thread runtime, closing the
/// tunnel on every path.
fn with_tunnel<F, Fut>(session: &Session, f: F) -> Result<String>
where
    F: FnOnce(Arc<Tunnel>) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let tunnel = Arc::new(Tunnel::create(session, TunnelOptions::default()).await?);
        let result = f(tunnel.clone()).await;
        tunnel.close();
        result
    })
}

/// Install the process logger once and apply the session's level.
fn init_logging(level: LogLevel) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format_timestamp_millis()
        .try_init();
    log::set_max_level(level.level_filter());
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Hand a string to the caller, cut at the first NUL byte.
fn into_c_string(s: &str) -> *mut c_char {
    let end = s.find('\0').unwrap_or(s.len());
    CString::new(&s[..end])
        .map(CString::into_raw)
        .unwrap_or(ptr::null_mut())
}

/// Fixed message describing which stage of a UDP exchange failed.
fn udp_error_message(err: &Error) -> &'static str {
    match err {
        Error::Parse(_) => "failed to parse config",
        Error::Network {
            stage: NetworkStage::Dial,
            ..
        } => "failed to dial UDP",
        Error::Network {
            stage: NetworkStage::Write,
            ..
        } => "failed to send UDP datagram",
        Error::Network {
            stage: NetworkStage::Read,
            ..
        } => "failed to read UDP reply",
        _ => "failed to create tunnel",
    }
}

/// Send an HTTP request to the Unified Endpoint.
///
/// # Returns
///
/// The response body, or NULL on any error.
///
/// # Safety
///
/// Every argument must be NULL or a valid null-terminated string.
#[export_name = "Send"]
pub unsafe extern "C" fn soratun_send(
    config_json: *const c_char,
    method: *const c_char,
    path: *const c_char,
    body: *const c_char,
) -> *mut c_char {
    let (Some(config_json), Some(method), Some(path), Some(body)) =
        (c_str(config_json), c_str(method), c_str(path), c_str(body))
    else {
        return ptr::null_mut();
    };

    match send(config_json, method, path, body) {
        Ok(response) => into_c_string(&response),
        Err(e) => {
            log::error!("Send failed: {}", e);
            ptr::null_mut()
        }
    }
}

/// Send a UDP datagram to the Unified Endpoint.
///
/// # Returns
///
/// The reply text, or a fixed message naming the stage that failed. Never NULL
/// unless allocation of the message itself fails.
///
/// # Safety
///
/// `config_json` must be a valid null-terminated string and `body` must point
/// to at least `body_length` readable bytes.
#[export_name = "SendUDP"]
pub unsafe extern "C" fn soratun_send_udp(
    config_json: *const c_char,
    body: *const u8,
    body_length: c_int,
) -> *mut c_char {
    let Some(config_json) = c_str(config_json) else {
        return into_c_string("invalid arguments");
    };
    let body = match usize::try_from(body_length) {
        Ok(0) => &[][..],
        Ok(len) if !body.is_null() => std::slice::from_raw_parts(body, len),
        _ => return into_c_string("invalid arguments"),
    };

    match send_udp(config_json, body) {
        Ok(reply) => into_c_string(&reply),
        Err(e) => {
            log::error!("SendUDP failed: {}", e);
            into_c_string(udp_error_message(&e))
        }
    }
}

/// Release a string returned by `Send` or `SendUDP`.
///
/// # Safety
///
/// `s` must be NULL or a pointer returned by this library that has not been
/// freed yet.
#[export_name = "FreeString"]
pub unsafe extern "C" fn soratun_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";

    fn take(s: *mut c_char) -> String {
        assert!(!s.is_null());
        let owned = unsafe { CStr::from_ptr(s) }.to_str().unwrap().to_string();
        unsafe { soratun_free_string(s) };
        owned
    }

    #[test]
    fn test_send_rejects_bad_config() {
        assert!(matches!(send("{", "GET", "x", "y"), Err(Error::Parse(_))));

        let json = format!(r#"{{"privateKey":"{}"}}"#, PRIVATE_KEY);
        assert!(matches!(send(&json, "GET", "x", "y"), Err(Error::MissingSession)));
    }

    #[test]
    fn test_send_validates_before_tunnel() {
        // No session: validation must fail first
        let json = format!(r#"{{"privateKey":"{}"}}"#, PRIVATE_KEY);
        assert!(matches!(
            send(&json, "PUT", "x", "y"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_send_udp_messages() {
        assert!(matches!(send_udp("nope", b"x"), Err(Error::Parse(_))));

        let config = CString::new("nope").unwrap();
        let reply = unsafe { soratun_send_udp(config.as_ptr(), b"x".as_ptr(), 1) };
        assert_eq!(take(reply), "failed to parse config");

        let json = CString::new(format!(r#"{{"privateKey":"{}"}}"#, PRIVATE_KEY)).unwrap();
        let reply = unsafe { soratun_send_udp(json.as_ptr(), b"x".as_ptr(), 1) };
        assert_eq!(take(reply), "failed to create tunnel");

        let reply = unsafe { soratun_send_udp(json.as_ptr(), ptr::null(), 4) };
        assert_eq!(take(reply), "invalid arguments");

        let reply = unsafe { soratun_send_udp(json.as_ptr(), b"x".as_ptr(), -1) };
        assert_eq!(take(reply), "invalid arguments");

        let reply = unsafe { soratun_send_udp(ptr::null(), b"x".as_ptr(), 1) };
        assert_eq!(take(reply), "invalid arguments");
    }

    #[test]
    fn test_send_null_on_error() {
        let json = CString::new("{}").unwrap();
        let method = CString::new("GET").unwrap();
        let path = CString::new("status").unwrap();
        let body = CString::new("{}").unwrap();

        let result = unsafe {
            soratun_send(json.as_ptr(), method.as_ptr(), path.as_ptr(), body.as_ptr())
        };
        assert!(result.is_null());

        let result =
            unsafe { soratun_send(ptr::null(), method.as_ptr(), path.as_ptr(), body.as_ptr()) };
        assert!(result.is_null());
    }

    #[test]
    fn test_udp_error_message() {
        let err = Error::network(NetworkStage::Read)(std::io::ErrorKind::TimedOut.into());
        assert_eq!(udp_error_message(&err), "failed to read UDP reply");
        let err = Error::network(NetworkStage::Write)(std::io::ErrorKind::BrokenPipe.into());
        assert_eq!(udp_error_message(&err), "failed to send UDP datagram");
    }

    #[test]
    fn test_into_c_string_truncates_at_nul() {
        assert_eq!(take(into_c_string("abc\0def")), "abc");
    }
}
