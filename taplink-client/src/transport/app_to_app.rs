//! The in-process app-to-app transport.
//!
//! When the merchant application and the Tapro application share a device,
//! frames travel over an in-process duplex channel instead of a socket. The
//! host application drives per-call completion itself, which is why calls
//! sent over this transport register without an expiry deadline.

use std::sync::Arc;

use async_trait::async_trait;
use taplink_types::{
    TraceId,
    error::{TapError, error_codes},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConnectionConfig,
    transport::{ConnectionStatus, FrameReceiver, StatusListener, Transport, TransportShared},
};

/// A duplex frame channel to the Tapro host application.
pub struct HostAppChannel {
    /// Frames from the SDK to the host application.
    pub to_host: mpsc::Sender<Vec<u8>>,
    /// Frames from the host application to the SDK.
    pub from_host: mpsc::Receiver<Vec<u8>>,
}

/// Opens channels to the Tapro host application.
#[async_trait]
pub trait HostAppGateway: Send + Sync {
    /// `true` iff the host application is installed on this device.
    fn is_installed(&self) -> bool;

    /// Opens a fresh duplex channel.
    async fn open(&self) -> Result<HostAppChannel, TapError>;
}

struct ActiveLink {
    to_host: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

/// Transport over in-process IPC with the host application.
#[derive(Clone)]
pub struct AppToAppTransport {
    inner: Arc<AppToAppInner>,
}

struct AppToAppInner {
    gateway: Arc<dyn HostAppGateway>,
    shared: TransportShared,
    link: parking_lot::Mutex<Option<ActiveLink>>,
}

impl AppToAppTransport {
    /// Creates the transport over the given gateway.
    pub fn new(gateway: Arc<dyn HostAppGateway>) -> Self {
        Self {
            inner: Arc::new(AppToAppInner {
                gateway,
                shared: TransportShared::default(),
                link: parking_lot::Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Transport for AppToAppTransport {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<(), TapError> {
        let inner = &self.inner;
        if !inner.gateway.is_installed() {
            inner.shared.transition(ConnectionStatus::Error);
            return Err(TapError::from_code(error_codes::HOST_APP_MISSING));
        }
        inner.shared.transition(ConnectionStatus::Connecting);
        let channel = match inner.gateway.open().await {
            Ok(channel) => channel,
            Err(err) => {
                inner.shared.transition(ConnectionStatus::Error);
                return Err(err);
            }
        };
        let cancel = CancellationToken::new();
        *inner.link.lock() = Some(ActiveLink {
            to_host: channel.to_host,
            cancel: cancel.clone(),
        });
        tokio::spawn(pump_task(Arc::clone(inner), channel.from_host, cancel));
        inner.shared.transition(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(link) = self.inner.link.lock().take() {
            link.cancel.cancel();
        }
        self.inner.shared.transition(ConnectionStatus::Disconnected);
    }

    async fn send(&self, trace_id: &TraceId, bytes: Vec<u8>) -> Result<(), TapError> {
        let to_host = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.to_host.clone())
            .ok_or_else(|| {
                TapError::from_code(error_codes::NOT_CONNECTED).with_trace_id(trace_id.clone())
            })?;
        to_host.send(bytes).await.map_err(|_| {
            TapError::from_code(error_codes::HOST_APP_UNREACHABLE).with_trace_id(trace_id.clone())
        })
    }

    fn set_receiver(&self, receiver: FrameReceiver) {
        self.inner.shared.set_receiver(receiver);
    }

    fn set_status_listener(&self, listener: StatusListener) {
        self.inner.shared.set_status_listener(listener);
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.shared.status()
    }
}

async fn pump_task(
    inner: Arc<AppToAppInner>,
    mut from_host: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = from_host.recv() => frame,
        };
        match frame {
            Some(frame) => inner.shared.deliver(frame),
            None => break,
        }
    }
    // host application went away
    inner.link.lock().take();
    inner.shared.transition(ConnectionStatus::Disconnected);
}
