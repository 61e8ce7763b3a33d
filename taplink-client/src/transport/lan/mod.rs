//! The WebSocket-over-LAN transport.
//!
//! Four sub-machines coexist here: the direct-connect path with its
//! discovery fallback, continuous service monitoring, the heartbeat
//! supervisor and the reader/writer pump of the active socket. Connection
//! changing operations are serialized by one operation mutex with try-lock
//! semantics; a second concurrent connect is rejected, not queued. Every
//! suspension point of an attempt re-checks the operation id so a
//! superseded attempt abandons silently.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable as _};
use futures::{SinkExt as _, StreamExt as _};
use taplink_types::{
    TraceId,
    error::{TapError, error_codes},
};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConnectionConfig, ConnectionMode, LanSettings},
    metrics::{
        METRICS_ID_SDK_CONNECT_ATTEMPTS, METRICS_ID_SDK_CONNECT_FAILURES,
        METRICS_ID_SDK_DISCOVERY_ROUNDS,
    },
    transport::{ConnectionStatus, FrameReceiver, StatusListener, Transport, TransportShared},
};

pub mod discovery;
pub(crate) mod heartbeat;
mod ws;

use discovery::{DiscoveryEvent, ServiceBrowser};
use heartbeat::{HeartbeatObserver, heartbeat_task, parse_heartbeat};
use ws::{WebSocketSession, WsSink, WsStream};

/// Decides whether a newly advertised endpoint should cause a reconnect.
///
/// Arguments: `(service_name, new_host, new_port, old_host, old_port)`.
/// Returning `true` means the upper layer will initiate a reconnect to the
/// advertised endpoint; `false` skips the candidate.
pub type AddressChangeListener = Arc<dyn Fn(&str, &str, u16, &str, u16) -> bool + Send + Sync>;

/// How an established connection was lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionLoss {
    /// The remote side or the socket dropped the link.
    Passive,
    /// The heartbeat supervisor declared the link dead. Service monitoring
    /// keeps running.
    Heartbeat,
}

/// Notified when an established connection is lost without a manual
/// disconnect (remote close, read error, heartbeat death).
pub type ConnectionLostListener = Arc<dyn Fn(TapError, ConnectionLoss) + Send + Sync>;

/// Notified when the continuous monitor accepted an address change; carries
/// the advertised `(host, port)` the upper layer should reconnect to.
pub type ReconnectRequestListener = Arc<dyn Fn(String, u16) + Send + Sync>;

/// A frame queued for the writer task.
pub(crate) enum OutboundFrame {
    /// An application payload.
    Payload(Vec<u8>),
    /// A heartbeat body, owned by the supervisor.
    Heartbeat(String),
}

struct ActiveConn {
    host: String,
    port: u16,
    writer: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

enum FallbackError {
    /// A newer operation claimed the transport.
    Superseded,
    /// No acceptable advertisement this round.
    NoService,
    /// An accepted candidate did not answer the dial.
    DialFailed(TapError),
}

/// The LAN transport.
#[derive(Clone)]
pub struct LanTransport {
    inner: Arc<LanInner>,
}

struct LanInner {
    settings: LanSettings,
    shared: TransportShared,
    operation: tokio::sync::Mutex<()>,
    operation_id: AtomicU64,
    browser: Arc<dyn ServiceBrowser>,
    conn: parking_lot::Mutex<Option<ActiveConn>>,
    monitor: parking_lot::Mutex<Option<CancellationToken>>,
    address_change: parking_lot::Mutex<Option<AddressChangeListener>>,
    connection_lost: parking_lot::Mutex<Option<ConnectionLostListener>>,
    reconnect_request: parking_lot::Mutex<Option<ReconnectRequestListener>>,
    manual_disconnect: AtomicBool,
}

impl LanTransport {
    /// Creates a LAN transport browsing with the given service browser.
    pub fn new(settings: LanSettings, browser: Arc<dyn ServiceBrowser>) -> Self {
        Self {
            inner: Arc::new(LanInner {
                settings,
                shared: TransportShared::default(),
                operation: tokio::sync::Mutex::new(()),
                operation_id: AtomicU64::new(0),
                browser,
                conn: parking_lot::Mutex::new(None),
                monitor: parking_lot::Mutex::new(None),
                address_change: parking_lot::Mutex::new(None),
                connection_lost: parking_lot::Mutex::new(None),
                reconnect_request: parking_lot::Mutex::new(None),
                manual_disconnect: AtomicBool::new(false),
            }),
        }
    }

    /// Installs the address-change decision point.
    pub fn set_address_change_listener(&self, listener: AddressChangeListener) {
        *self.inner.address_change.lock() = Some(listener);
    }

    /// Installs the connection-lost callback.
    pub fn set_connection_lost_listener(&self, listener: ConnectionLostListener) {
        *self.inner.connection_lost.lock() = Some(listener);
    }

    /// Installs the monitor's reconnect-request callback.
    pub fn set_reconnect_request_listener(&self, listener: ReconnectRequestListener) {
        *self.inner.reconnect_request.lock() = Some(listener);
    }

    /// The endpoint of the active connection, if any.
    pub fn current_endpoint(&self) -> Option<(String, u16)> {
        self.inner
            .conn
            .lock()
            .as_ref()
            .map(|conn| (conn.host.clone(), conn.port))
    }

    /// `true` while the continuous service monitor is running.
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().is_some()
    }
}

#[async_trait]
impl Transport for LanTransport {
    async fn connect(&self, config: &ConnectionConfig) -> Result<(), TapError> {
        debug_assert_eq!(config.mode, ConnectionMode::Lan);
        let inner = Arc::clone(&self.inner);
        let _guard = inner.operation.try_lock().map_err(|_| {
            TapError::with_message(
                error_codes::LAN_CANNOT_CONNECT,
                "cannot connect to server: another operation in progress",
            )
        })?;
        let op = inner.operation_id.fetch_add(1, Ordering::SeqCst) + 1;
        inner.manual_disconnect.store(false, Ordering::SeqCst);
        ::metrics::counter!(METRICS_ID_SDK_CONNECT_ATTEMPTS).increment(1);

        // a connect over an existing link replaces it
        inner.teardown_conn();
        inner.shared.transition(ConnectionStatus::Connecting);

        if let Some(host) = config.host.clone() {
            let port = config.lan_port();
            match WebSocketSession::dial(&host, port, config.secure).await {
                Ok(session) => {
                    inner.establish(session, host, port);
                    return Ok(());
                }
                Err(err) if err.code == error_codes::FORMAT_ERROR => {
                    inner.shared.transition(ConnectionStatus::Error);
                    ::metrics::counter!(METRICS_ID_SDK_CONNECT_FAILURES).increment(1);
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!("direct dial failed ({err}), falling back to discovery");
                }
            }
        }
        if inner.superseded(op) {
            return Err(superseded_error());
        }

        // discovery fallback, initial round plus three retries at 1s/2s/4s
        let backoff = ExponentialBuilder::default()
            .with_min_delay(std::time::Duration::from_secs(1))
            .with_factor(2.0)
            .with_max_times(3);
        let outcome = (|| inner.discover_and_dial(op, config))
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(|err| matches!(err, FallbackError::NoService | FallbackError::DialFailed(_)))
            .notify(|_, after| tracing::debug!("discovery round failed, retrying in {after:?}"))
            .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(FallbackError::Superseded) => Err(superseded_error()),
            Err(FallbackError::NoService) => {
                inner.shared.transition(ConnectionStatus::Error);
                ::metrics::counter!(METRICS_ID_SDK_CONNECT_FAILURES).increment(1);
                Err(TapError::from_code(error_codes::LAN_DISCOVERY_EMPTY))
            }
            Err(FallbackError::DialFailed(err)) => {
                inner.shared.transition(ConnectionStatus::Error);
                ::metrics::counter!(METRICS_ID_SDK_CONNECT_FAILURES).increment(1);
                Err(err)
            }
        }
    }

    async fn disconnect(&self) {
        let inner = &self.inner;
        inner.manual_disconnect.store(true, Ordering::SeqCst);
        // cancels any in-flight connect attempt at its next suspension point
        inner.operation_id.fetch_add(1, Ordering::SeqCst);
        inner.stop_monitoring();
        inner.teardown_conn();
        inner.shared.transition(ConnectionStatus::Disconnected);
    }

    async fn send(&self, trace_id: &TraceId, bytes: Vec<u8>) -> Result<(), TapError> {
        let writer = self
            .inner
            .conn
            .lock()
            .as_ref()
            .map(|conn| conn.writer.clone())
            .ok_or_else(|| {
                TapError::from_code(error_codes::NOT_CONNECTED).with_trace_id(trace_id.clone())
            })?;
        writer
            .send(OutboundFrame::Payload(bytes))
            .await
            .map_err(|_| {
                TapError::from_code(error_codes::SEND_FAILED).with_trace_id(trace_id.clone())
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

fn superseded_error() -> TapError {
    TapError::with_message(error_codes::LAN_CANNOT_CONNECT, "connect attempt superseded")
}

impl LanInner {
    fn superseded(&self, op: u64) -> bool {
        self.operation_id.load(Ordering::SeqCst) != op
    }

    /// One discovery round: browse for a window, offer valid advertisements
    /// to the address-change listener, dial the first accepted candidate.
    async fn discover_and_dial(
        self: &Arc<Self>,
        op: u64,
        config: &ConnectionConfig,
    ) -> Result<(), FallbackError> {
        if self.superseded(op) {
            return Err(FallbackError::Superseded);
        }
        ::metrics::counter!(METRICS_ID_SDK_DISCOVERY_ROUNDS).increment(1);
        let mut events = match self.browser.browse() {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!("cannot browse for terminals: {err}");
                return Err(FallbackError::NoService);
            }
        };
        let old_host = config.host.clone().unwrap_or_default();
        let old_port = config.lan_port();
        let listener = self.address_change.lock().clone();

        let window = tokio::time::sleep(self.settings.discovery_window);
        tokio::pin!(window);
        let candidate = loop {
            let event = tokio::select! {
                _ = &mut window => break None,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break None,
                },
            };
            if let DiscoveryEvent::Resolved(info) = event
                && info.is_valid()
            {
                let accepted = match &listener {
                    Some(listener) => {
                        listener(&info.name, &info.host, info.port, &old_host, old_port)
                    }
                    None => true,
                };
                if accepted {
                    break Some(info);
                }
                tracing::debug!("skipping discovered service {}", info.name);
            }
        };
        if self.superseded(op) {
            return Err(FallbackError::Superseded);
        }
        let Some(info) = candidate else {
            return Err(FallbackError::NoService);
        };
        tracing::info!("discovered {} at {}:{}", info.name, info.host, info.port);
        match WebSocketSession::dial(&info.host, info.port, config.secure).await {
            Ok(session) => {
                self.establish(session, info.host, info.port);
                Ok(())
            }
            Err(err) => Err(FallbackError::DialFailed(err)),
        }
    }

    /// Wires up the reader/writer pump, the heartbeat supervisor and the
    /// continuous service monitor for a freshly dialed socket.
    fn establish(self: &Arc<Self>, session: WebSocketSession, host: String, port: u16) {
        tracing::info!("connected to {}", session.endpoint);
        let (sink, stream) = session.split();
        let (writer_tx, writer_rx) = mpsc::channel(32);
        let (reply_tx, reply_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        *self.conn.lock() = Some(ActiveConn {
            host,
            port,
            writer: writer_tx.clone(),
            cancel: cancel.clone(),
        });

        tokio::spawn(writer_task(sink, writer_rx, cancel.clone()));
        tokio::spawn(reader_task(Arc::clone(self), stream, reply_tx, cancel.clone()));
        tokio::spawn(heartbeat_task(
            self.settings.clone(),
            writer_tx,
            reply_rx,
            Arc::new(LanHeartbeatObserver {
                inner: Arc::clone(self),
            }),
            cancel,
        ));
        self.start_monitoring();
        self.shared.transition(ConnectionStatus::Connected);
    }

    fn teardown_conn(&self) {
        if let Some(conn) = self.conn.lock().take() {
            conn.cancel.cancel();
        }
    }

    fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *monitor = Some(cancel.clone());
        drop(monitor);
        tokio::spawn(monitor_task(Arc::clone(self), cancel));
    }

    fn stop_monitoring(&self) {
        if let Some(cancel) = self.monitor.lock().take() {
            cancel.cancel();
        }
    }

    /// The remote side (or the socket) dropped the link.
    fn handle_passive_loss(&self) {
        if self.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }
        if self.conn.lock().is_none() {
            // already torn down by the heartbeat path
            return;
        }
        tracing::warn!("connection lost");
        self.teardown_conn();
        self.shared.transition(ConnectionStatus::Disconnected);
        self.notify_connection_lost(
            TapError::from_code(error_codes::DISCONNECTED),
            ConnectionLoss::Passive,
        );
    }

    /// The heartbeat supervisor declared the connection dead. The socket
    /// goes down; service monitoring stays up for rediscovery.
    fn handle_heartbeat_death(&self) {
        tracing::warn!("heartbeat failed twice, declaring connection dead");
        self.teardown_conn();
        self.shared.transition(ConnectionStatus::Disconnected);
        self.notify_connection_lost(
            TapError::with_message(
                error_codes::DISCONNECTED,
                "connection lost: heartbeat timeout",
            ),
            ConnectionLoss::Heartbeat,
        );
    }

    fn notify_connection_lost(&self, error: TapError, loss: ConnectionLoss) {
        let listener = self.connection_lost.lock().clone();
        if let Some(listener) = listener {
            listener(error, loss);
        }
    }
}

struct LanHeartbeatObserver {
    inner: Arc<LanInner>,
}

impl HeartbeatObserver for LanHeartbeatObserver {
    fn on_delayed(&self, rtt: std::time::Duration) {
        tracing::debug!("heartbeat reply delayed by {rtt:?}");
    }

    fn on_timeout(&self, consecutive_failures: u32) {
        tracing::debug!("heartbeat timeout, {consecutive_failures} consecutive");
    }

    fn on_failed(&self) {
        tracing::debug!("heartbeat send failed");
    }

    fn on_dead(&self) {
        self.inner.handle_heartbeat_death();
    }
}

/// Continuous service monitoring.
///
/// Runs from the first successful connect until a manual disconnect,
/// surviving heartbeat-induced socket loss. Resolution updates that do not
/// change a service's `(host, port)` are dropped; a lost advertisement is
/// logged but never tears the connection down by itself.
async fn monitor_task(inner: Arc<LanInner>, cancel: CancellationToken) {
    let mut events = match inner.browser.browse() {
        Ok(events) => events,
        Err(err) => {
            tracing::warn!("cannot monitor terminal services: {err}");
            return;
        }
    };
    let mut known: HashMap<String, (String, u16)> = HashMap::new();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            DiscoveryEvent::Resolved(info) if info.is_valid() => {
                let previous = known.get(&info.name).cloned();
                if let Some((host, port)) = &previous
                    && *host == info.host
                    && *port == info.port
                {
                    continue;
                }
                let (old_host, old_port) = previous
                    .or_else(|| {
                        inner
                            .conn
                            .lock()
                            .as_ref()
                            .map(|conn| (conn.host.clone(), conn.port))
                    })
                    .unwrap_or_default();
                known.insert(info.name.clone(), (info.host.clone(), info.port));
                let listener = inner.address_change.lock().clone();
                if let Some(listener) = listener
                    && listener(&info.name, &info.host, info.port, &old_host, old_port)
                {
                    tracing::info!(
                        "service {} moved to {}:{}, reconnect accepted",
                        info.name,
                        info.host,
                        info.port
                    );
                    let reconnect = inner.reconnect_request.lock().clone();
                    if let Some(reconnect) = reconnect {
                        reconnect(info.host.clone(), info.port);
                    }
                }
            }
            DiscoveryEvent::Resolved(info) => {
                tracing::trace!("ignoring unresolvable advertisement {}", info.name);
            }
            DiscoveryEvent::Removed { name } => {
                // a lost service does not disconnect; heartbeat failure does
                tracing::debug!("service {name} lost");
                known.remove(&name);
            }
        }
    }
}

async fn writer_task(
    mut sink: WsSink,
    mut frames: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let message = match frame {
            OutboundFrame::Payload(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Message::text(text),
                Err(err) => Message::binary(err.into_bytes()),
            },
            OutboundFrame::Heartbeat(body) => Message::text(body),
        };
        if let Err(err) = sink.send(message).await {
            tracing::debug!("ws write failed: {err}");
            break;
        }
    }
    // we close the websocket on best-effort basis
    let _ = sink.close().await;
}

async fn reader_task(
    inner: Arc<LanInner>,
    mut stream: WsStream,
    replies: mpsc::Sender<u64>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                if let Some(seq) = parse_heartbeat(text.as_str()) {
                    let _ = replies.try_send(seq);
                    continue;
                }
                inner.shared.deliver(text.as_str().as_bytes().to_vec());
            }
            Some(Ok(Message::Binary(bytes))) => inner.shared.deliver(bytes.to_vec()),
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!("server closed the connection: {frame:?}");
                break;
            }
            // tungstenite answers pings internally
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::debug!("ws read failed: {err}");
                break;
            }
            None => break,
        }
    }
    inner.handle_passive_loss();
}
