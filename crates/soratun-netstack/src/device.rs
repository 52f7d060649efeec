//! WireGuard device driving a virtual interface.
//!
//! A [`WireGuardDevice`] is created over a [`TunDevice`], configured with a
//! UAPI text block through [`ipc_set`](WireGuardDevice::ipc_set), and brought
//! up with [`up`](WireGuardDevice::up), which spawns the background tasks that
//! move packets between the network stack and the peer.

use crate::error::{Error, Result};
use crate::netstack::{NetStack, TunDevice};
use crate::wireguard::{WireGuardConfig, WireGuardTunnel};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// A userspace WireGuard device bound to one virtual interface.
pub struct WireGuardDevice {
    netstack: Arc<NetStack>,
    outbound_rx: Option<mpsc::Receiver<BytesMut>>,
    config: Option<WireGuardConfig>,
    tunnel: Option<Arc<WireGuardTunnel>>,
    tasks: JoinSet<()>,
    closed: bool,
}

impl WireGuardDevice {
    /// Create an unconfigured device over `tun`.
    pub fn new(tun: TunDevice) -> Self {
        let (netstack, outbound_rx) = tun.into_parts();
        Self {
            netstack,
            outbound_rx: Some(outbound_rx),
            config: None,
            tunnel: None,
            tasks: JoinSet::new(),
            closed: false,
        }
    }

    /// The network stack this device carries packets for.
    pub fn netstack(&self) -> &Arc<NetStack> {
        &self.netstack
    }

    /// The configuration applied by the last successful [`ipc_set`](Self::ipc_set).
    pub fn config(&self) -> Option<&WireGuardConfig> {
        self.config.as_ref()
    }

    /// Apply a UAPI configuration block. Only allowed before the device is up.
    pub fn ipc_set(&mut self, uapi: &str) -> Result<()> {
        if self.closed || self.tunnel.is_some() {
            return Err(Error::DeviceUnavailable);
        }

        let config = WireGuardConfig::from_uapi(uapi)?;
        log::debug!("Device configured: {:?}", config);
        self.config = Some(config);
        Ok(())
    }

    /// Bring the device up: bind the peer socket, start the packet loops and
    /// send the first handshake initiation.
    pub async fn up(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::DeviceUnavailable);
        }
        let config = self.config.clone().ok_or(Error::NotConfigured)?;
        let outbound_rx = self.outbound_rx.take().ok_or(Error::DeviceUnavailable)?;

        let wg_tunnel = WireGuardTunnel::new(config, outbound_rx)
            .await
            .map_err(|e| Error::TunnelCreation(e.to_string()))?;

        let incoming_rx = wg_tunnel
            .take_incoming_receiver()
            .ok_or_else(|| Error::TunnelCreation("Failed to get incoming receiver".into()))?;

        log::debug!("Starting device tasks...");

        let wg = wg_tunnel.clone();
        self.tasks.spawn(async move {
            if let Err(e) = wg.run_receive_loop().await {
                log::error!("WireGuard receive loop error: {}", e);
            }
        });

        let wg = wg_tunnel.clone();
        self.tasks.spawn(async move {
            if let Err(e) = wg.run_send_loop().await {
                log::error!("WireGuard send loop error: {}", e);
            }
        });

        let wg = wg_tunnel.clone();
        self.tasks.spawn(async move {
            if let Err(e) = wg.run_timer_loop().await {
                log::error!("WireGuard timer loop error: {}", e);
            }
        });

        let ns = self.netstack.clone();
        self.tasks.spawn(async move {
            if let Err(e) = ns.run_poll_loop().await {
                log::error!("Network stack poll loop error: {}", e);
            }
        });

        let ns = self.netstack.clone();
        self.tasks.spawn(async move {
            if let Err(e) = ns.run_rx_loop(incoming_rx).await {
                log::error!("Network stack RX loop error: {}", e);
            }
        });

        self.tunnel = Some(wg_tunnel.clone());

        wg_tunnel
            .initiate_handshake()
            .await
            .map_err(|e| Error::TunnelCreation(e.to_string()))?;

        log::info!("WireGuard device up ({})", self.netstack.address());
        Ok(())
    }

    /// Whether [`up`](Self::up) has succeeded and the device is not closed.
    pub fn is_up(&self) -> bool {
        self.tunnel.is_some() && !self.closed
    }

    /// Wait until a handshake with the peer completes.
    pub async fn wait_for_handshake(&self, timeout: Duration) -> Result<()> {
        match &self.tunnel {
            Some(tunnel) => tunnel.wait_for_handshake(timeout).await,
            None => Err(Error::NotConfigured),
        }
    }

    /// Returns the time elapsed since the last successful handshake.
    pub fn time_since_last_handshake(&self) -> Option<Duration> {
        self.tunnel.as_ref()?.time_since_last_handshake()
    }

    /// Stop all device tasks and close the network stack. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.tasks.abort_all();
        self.netstack.close();
        self.tunnel = None;
        log::info!("WireGuard device closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for WireGuardDevice {
    fn drop(&mut self) {
        self.close();
    }
}
