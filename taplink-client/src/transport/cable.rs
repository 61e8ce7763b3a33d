//! The USB/serial cable transport.
//!
//! The cable link layer itself is out of scope; the platform hands the SDK
//! an opaque byte duplex and this transport frames envelopes over it as
//! newline-delimited JSON. Protocol selection probes the supported
//! protocols in order and remembers the winner for five minutes.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use taplink_types::{
    TraceId,
    error::{TapError, error_codes},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{CableProtocol, ConnectionConfig},
    store::{PreferenceStore, keys},
    transport::{ConnectionStatus, FrameReceiver, StatusListener, Transport, TransportShared},
};

/// How long a detected cable protocol stays valid.
const DETECTION_VALIDITY: Duration = Duration::from_secs(5 * 60);

/// Probe order for automatic protocol selection.
const PROBE_ORDER: [CableProtocol; 3] = [
    CableProtocol::UsbAoa,
    CableProtocol::UsbVsp,
    CableProtocol::Rs232,
];

/// An opaque byte duplex to the terminal.
pub trait CableDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> CableDuplex for T {}

/// Opens cable links for a concrete platform.
#[async_trait]
pub trait CableLinkProvider: Send + Sync {
    /// `true` iff a cable is physically attached.
    fn is_attached(&self) -> bool;

    /// Opens the duplex for one protocol.
    ///
    /// Errors use the cable range: permission denied `252`, timeout `253`,
    /// unsupported protocol `254`, device not ready `255`.
    async fn open(&self, protocol: CableProtocol) -> Result<Box<dyn CableDuplex>, TapError>;
}

struct ActiveCable {
    writer: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// Transport over a cable link.
#[derive(Clone)]
pub struct CableTransport {
    inner: Arc<CableInner>,
}

struct CableInner {
    provider: Arc<dyn CableLinkProvider>,
    store: Arc<dyn PreferenceStore>,
    shared: TransportShared,
    cable: parking_lot::Mutex<Option<ActiveCable>>,
}

impl CableTransport {
    /// Creates the transport over the given link provider.
    ///
    /// The preference store caches the detected protocol across processes.
    pub fn new(provider: Arc<dyn CableLinkProvider>, store: Arc<dyn PreferenceStore>) -> Self {
        Self {
            inner: Arc::new(CableInner {
                provider,
                store,
                shared: TransportShared::default(),
                cable: parking_lot::Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Transport for CableTransport {
    async fn connect(&self, config: &ConnectionConfig) -> Result<(), TapError> {
        let inner = &self.inner;
        if !inner.provider.is_attached() {
            inner.shared.transition(ConnectionStatus::Error);
            return Err(TapError::from_code(error_codes::CABLE_NOT_ATTACHED));
        }
        inner.shared.transition(ConnectionStatus::Connecting);
        let duplex = match inner.open_link(config.cable_protocol).await {
            Ok(duplex) => duplex,
            Err(err) => {
                inner.shared.transition(ConnectionStatus::Error);
                return Err(err);
            }
        };
        let (sink, stream) = Framed::new(duplex, LinesCodec::new()).split();
        let (writer_tx, writer_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        *inner.cable.lock() = Some(ActiveCable {
            writer: writer_tx,
            cancel: cancel.clone(),
        });
        tokio::spawn(writer_task(sink, writer_rx, cancel.clone()));
        tokio::spawn(reader_task(Arc::clone(inner), stream, cancel));
        inner.shared.transition(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(cable) = self.inner.cable.lock().take() {
            cable.cancel.cancel();
        }
        self.inner.shared.transition(ConnectionStatus::Disconnected);
    }

    async fn send(&self, trace_id: &TraceId, bytes: Vec<u8>) -> Result<(), TapError> {
        let writer = self
            .inner
            .cable
            .lock()
            .as_ref()
            .map(|cable| cable.writer.clone())
            .ok_or_else(|| {
                TapError::from_code(error_codes::NOT_CONNECTED).with_trace_id(trace_id.clone())
            })?;
        let line = String::from_utf8(bytes).map_err(|_| {
            TapError::with_message(error_codes::FORMAT_ERROR, "frame is not valid UTF-8")
                .with_trace_id(trace_id.clone())
        })?;
        writer.send(line).await.map_err(|_| {
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

impl CableInner {
    /// Opens the duplex, resolving `Auto` through the cached detection or a
    /// fresh probe.
    async fn open_link(&self, protocol: CableProtocol) -> Result<Box<dyn CableDuplex>, TapError> {
        if protocol != CableProtocol::Auto {
            return self.provider.open(protocol).await;
        }
        if let Some(cached) = self.cached_detection() {
            tracing::debug!("reusing detected cable protocol {cached:?}");
            match self.provider.open(cached).await {
                Ok(duplex) => return Ok(duplex),
                Err(err) => {
                    tracing::debug!("cached protocol {cached:?} no longer works: {err}");
                    self.store.remove(keys::DETECTED_CABLE_PROTOCOL);
                }
            }
        }
        let mut last_error = TapError::from_code(error_codes::CABLE_UNSUPPORTED_PROTOCOL);
        for candidate in PROBE_ORDER {
            match self.provider.open(candidate).await {
                Ok(duplex) => {
                    self.remember_detection(candidate);
                    return Ok(duplex);
                }
                Err(err) => {
                    tracing::debug!("cable probe {candidate:?} failed: {err}");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn cached_detection(&self) -> Option<CableProtocol> {
        let protocol = self.store.get(keys::DETECTED_CABLE_PROTOCOL)?;
        let detected_at_ms: u64 = self
            .store
            .get(keys::DETECTED_CABLE_PROTOCOL_AT)?
            .parse()
            .ok()?;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if now_ms.saturating_sub(detected_at_ms) > DETECTION_VALIDITY.as_millis() as u64 {
            return None;
        }
        serde_json::from_str(&protocol).ok()
    }

    fn remember_detection(&self, protocol: CableProtocol) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.store.put(
            keys::DETECTED_CABLE_PROTOCOL,
            serde_json::to_string(&protocol).expect("protocol serializes"),
        );
        self.store
            .put(keys::DETECTED_CABLE_PROTOCOL_AT, now_ms.to_string());
    }
}

async fn writer_task(
    mut sink: futures::stream::SplitSink<Framed<Box<dyn CableDuplex>, LinesCodec>, String>,
    mut lines: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        if let Err(err) = sink.send(line).await {
            tracing::debug!("cable write failed: {err}");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn reader_task(
    inner: Arc<CableInner>,
    mut stream: futures::stream::SplitStream<Framed<Box<dyn CableDuplex>, LinesCodec>>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = stream.next() => line,
        };
        match line {
            Some(Ok(line)) => inner.shared.deliver(line.into_bytes()),
            Some(Err(err)) => {
                tracing::debug!("cable read failed: {err}");
                break;
            }
            None => break,
        }
    }
    inner.cable.lock().take();
    inner.shared.transition(ConnectionStatus::Disconnected);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::store::MemoryPreferenceStore;
    use tokio::io::DuplexStream;

    struct FakeProvider {
        attached: bool,
        working: CableProtocol,
        peer: parking_lot::Mutex<Option<DuplexStream>>,
    }

    impl FakeProvider {
        fn new(attached: bool, working: CableProtocol) -> Self {
            Self {
                attached,
                working,
                peer: parking_lot::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl CableLinkProvider for FakeProvider {
        fn is_attached(&self) -> bool {
            self.attached
        }

        async fn open(&self, protocol: CableProtocol) -> Result<Box<dyn CableDuplex>, TapError> {
            if protocol != self.working {
                return Err(TapError::from_code(error_codes::CABLE_UNSUPPORTED_PROTOCOL));
            }
            let (ours, theirs) = tokio::io::duplex(4096);
            *self.peer.lock() = Some(theirs);
            Ok(Box::new(ours))
        }
    }

    #[tokio::test]
    async fn detached_cable_fails_with_251() {
        let provider = Arc::new(FakeProvider::new(false, CableProtocol::Rs232));
        let store = Arc::new(MemoryPreferenceStore::new());
        let transport = CableTransport::new(provider, store);
        let err = transport
            .connect(&ConnectionConfig::cable(CableProtocol::Auto))
            .await
            .unwrap_err();
        assert_eq!(err.code, "251");
    }

    #[tokio::test]
    async fn auto_probe_finds_and_remembers_the_protocol() {
        let provider = Arc::new(FakeProvider::new(true, CableProtocol::UsbVsp));
        let store = Arc::new(MemoryPreferenceStore::new());
        let transport = CableTransport::new(provider, Arc::clone(&store) as _);
        transport
            .connect(&ConnectionConfig::cable(CableProtocol::Auto))
            .await
            .unwrap();
        assert_eq!(transport.status(), ConnectionStatus::Connected);
        let remembered = store.get(keys::DETECTED_CABLE_PROTOCOL).unwrap();
        assert_eq!(
            serde_json::from_str::<CableProtocol>(&remembered).unwrap(),
            CableProtocol::UsbVsp
        );
    }
}
