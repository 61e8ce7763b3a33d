//! Shared fixtures for the SDK test suite.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use taplink_client::{
    ConnectionListener, DeviceInfo, DisconnectReason, LanSettings, SdkConfig, TapLinkSdk,
    TransactionCallback, TransactionResult,
    store::MemoryPreferenceStore,
    transport::lan::discovery::{DiscoveryEvent, ServiceBrowser, ServiceInfo, SERVICE_TYPE},
};
use taplink_types::{
    error::TapError,
    event::PaymentEvent,
    request::{Amount, SaleRequest},
};
use tokio::sync::mpsc;

/// Aggressive timings so heartbeat and timeout paths run in milliseconds.
pub fn fast_lan_settings() -> LanSettings {
    LanSettings {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(80),
        discovery_window: Duration::from_millis(200),
        reconnect_max_retries: 2,
        ..LanSettings::default()
    }
}

/// A browser fed by the test instead of multicast.
#[derive(Default)]
pub struct ScriptedBrowser {
    services: Mutex<Vec<ServiceInfo>>,
    subscribers: Mutex<Vec<mpsc::Sender<DiscoveryEvent>>>,
    browse_count: std::sync::atomic::AtomicUsize,
}

impl ScriptedBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How many browse sessions were opened.
    pub fn browse_count(&self) -> usize {
        self.browse_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Advertises a service to current and future browse sessions.
    pub fn announce(&self, info: ServiceInfo) {
        self.services.lock().push(info.clone());
        self.subscribers
            .lock()
            .retain(|tx| tx.try_send(DiscoveryEvent::Resolved(info.clone())).is_ok());
    }

    pub fn service(name: &str, host: &str, port: u16) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            service_type: SERVICE_TYPE.to_string(),
            host: host.to_string(),
            port,
            attributes: Default::default(),
        }
    }
}

impl ServiceBrowser for ScriptedBrowser {
    fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TapError> {
        self.browse_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(32);
        for info in self.services.lock().iter() {
            let _ = tx.try_send(DiscoveryEvent::Resolved(info.clone()));
        }
        self.subscribers.lock().push(tx);
        Ok(rx)
    }
}

/// What a connection listener observed, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnEvent {
    Waiting,
    Connected(String, String),
    Disconnected,
    Error(String),
}

pub struct RecordingListener {
    tx: mpsc::UnboundedSender<ConnEvent>,
}

pub fn recording_listener() -> (Arc<RecordingListener>, mpsc::UnboundedReceiver<ConnEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingListener { tx }), rx)
}

impl ConnectionListener for RecordingListener {
    fn on_waiting_connect(&self) {
        let _ = self.tx.send(ConnEvent::Waiting);
    }

    fn on_connected(&self, device: &DeviceInfo) {
        let _ = self.tx.send(ConnEvent::Connected(
            device.device_id.to_string(),
            device.tapro_version.clone(),
        ));
    }

    fn on_disconnected(&self, _reason: &DisconnectReason) {
        let _ = self.tx.send(ConnEvent::Disconnected);
    }

    fn on_error(&self, error: &TapError) {
        let _ = self.tx.send(ConnEvent::Error(error.code.clone()));
    }
}

/// What a transaction callback observed, in order.
#[derive(Clone, Debug)]
pub enum TxEvent {
    Progress(&'static str),
    Success(Box<TransactionResult>),
    Failure(TapError),
}

pub struct RecordingCallback {
    tx: mpsc::UnboundedSender<TxEvent>,
}

pub fn recording_callback() -> (Arc<RecordingCallback>, mpsc::UnboundedReceiver<TxEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingCallback { tx }), rx)
}

impl TransactionCallback for RecordingCallback {
    fn on_success(&self, result: TransactionResult) {
        let _ = self.tx.send(TxEvent::Success(Box::new(result)));
    }

    fn on_failure(&self, error: TapError) {
        let _ = self.tx.send(TxEvent::Failure(error));
    }

    fn on_progress(&self, event: PaymentEvent, _message: &str) {
        let _ = self.tx.send(TxEvent::Progress(event.code()));
    }
}

/// Awaits the next event or panics after `timeout`.
pub async fn next_event<T: std::fmt::Debug>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    timeout: Duration,
) -> T {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("no event before the deadline")
        .expect("event channel closed")
}

pub struct TestSdk {
    pub sdk: TapLinkSdk,
    pub browser: Arc<ScriptedBrowser>,
    pub store: Arc<MemoryPreferenceStore>,
}

/// A fresh SDK over a scripted browser and an in-memory store.
pub fn build_sdk() -> TestSdk {
    build_sdk_with_store(Arc::new(MemoryPreferenceStore::new()))
}

pub fn build_sdk_with_store(store: Arc<MemoryPreferenceStore>) -> TestSdk {
    let browser = ScriptedBrowser::new();
    let sdk = TapLinkSdk::builder(SdkConfig {
        app_id: "test-pos".to_string(),
        secret_key: "test-secret".to_string(),
        version: "1.0".to_string(),
    })
    .lan_settings(fast_lan_settings())
    .preference_store(Arc::clone(&store) as _)
    .service_browser(Arc::clone(&browser) as _)
    .build();
    TestSdk {
        sdk,
        browser,
        store,
    }
}

pub fn sale_request(reference: &str, amount: &str, currency: &str) -> SaleRequest {
    SaleRequest {
        reference_order_id: reference.to_string(),
        amount: Amount::order_only(amount.parse().expect("decimal"), currency),
        payment_method: None,
        staff: None,
        description: None,
        attach: None,
        notify_url: None,
        request_timeout: None,
    }
}
