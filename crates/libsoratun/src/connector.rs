//! Custom connector for hyper that dials through a [`Dialer`].
//!
//! This module provides a tower::Service that lets `hyper-util`'s client open
//! its TCP connections through the tunnel's network stack instead of the host.

use crate::error::{Error, Result};
use crate::tunnel::Dialer;
use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tower_service::Service;

/// A connector that creates plain HTTP connections through a [`Dialer`].
pub struct TunnelConnector<D> {
    dialer: Arc<D>,
}

impl<D> TunnelConnector<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self { dialer }
    }
}

impl<D> Clone for TunnelConnector<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
        }
    }
}

impl<D: Dialer> Service<Uri> for TunnelConnector<D> {
    type Response = TunnelStream<D::Stream>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();

        Box::pin(async move {
            let host = uri.host().ok_or_else(|| Error::NoHost(uri.to_string()))?;
            // IPv6 hosts keep their brackets in `Uri::host`
            let address = format!("{}:{}", host, uri.port_u16().unwrap_or(80));

            log::debug!("Connecting to {}", address);
            let stream = dialer.dial_stream(&address).await?;
            log::debug!("Connected to {}", address);

            Ok(TunnelStream {
                inner: TokioIo::new(stream),
            })
        })
    }
}

/// A TCP stream through the tunnel, usable by hyper.
pub struct TunnelStream<S> {
    inner: TokioIo<S>,
}

impl<S> Connection for TunnelStream<S> {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Read for TunnelStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Write for TunnelStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
