#![deny(missing_docs, clippy::unwrap_used)]
//! Client SDK for TapLink payment terminals.
//!
//! The SDK brokers payment transactions between a merchant application and
//! a remote Tapro terminal. Three interchangeable transports hide behind a
//! uniform request/response surface built around a JSON envelope carrying a
//! monotonic trace identifier: in-process app-to-app IPC, a USB/serial
//! cable, and WebSocket-over-LAN with mDNS discovery and a heartbeat
//! supervisor.
//!
//! The entry point is [`TapLinkSdk`]. Construct it once per process with
//! [`TapLinkSdk::init`] (or [`TapLinkSdk::builder`] to inject platform
//! pieces), connect with a [`ConnectionConfig`], and execute transactions
//! through the per-action helpers. Every completion fires exactly once;
//! progress events stream to the same callback until a terminal event,
//! the per-call deadline, or a connection loss retires the call.
//!
//! ```no_run
//! use std::sync::Arc;
//! use taplink_client::{ConnectionConfig, SdkConfig, TapLinkSdk};
//!
//! # async fn run(listener: Arc<dyn taplink_client::ConnectionListener>) {
//! let sdk = TapLinkSdk::init(SdkConfig {
//!     app_id: "my-pos".to_string(),
//!     secret_key: "secret".to_string(),
//!     version: "1.0".to_string(),
//! });
//! let config = ConnectionConfig::lan("192.168.1.10", 8443, false);
//! sdk.connect(Some(config), listener).await.ok();
//! # }
//! ```
//!
//! If the terminal vanishes, the SDK fails every outstanding call with a
//! connection-class error, keeps watching mDNS for the device, and
//! reconnects subject to the device-identity and debounce rules. Callers
//! that want retry UX consult the predicates on
//! [`taplink_types::error::TapError`].

use std::sync::Arc;

pub mod callbacks;
pub mod config;
pub mod connection;
mod dispatch;
pub mod metrics;
pub mod orchestrator;
pub mod reconnect;
pub mod registry;
pub mod store;
pub mod transport;

pub use callbacks::{
    ConnectionListener, DeviceInfo, DisconnectReason, TransactionCallback, TransactionResult,
};
pub use config::{CableProtocol, ConnectionConfig, ConnectionMode, LanSettings, SdkConfig};
pub use connection::ConnectionManager;
pub use orchestrator::PaymentManager;
pub use registry::{CallKind, CallbackRegistry};
pub use taplink_types as types;
pub use transport::ConnectionStatus;

use crate::{
    reconnect::ReconnectPolicy,
    store::{MemoryPreferenceStore, PreferenceStore},
    transport::{
        app_to_app::{AppToAppTransport, HostAppGateway},
        cable::{CableLinkProvider, CableTransport},
        lan::{LanTransport, discovery::{MdnsBrowser, ServiceBrowser}},
    },
};

/// Builder for a [`TapLinkSdk`] with injected platform pieces.
///
/// The defaults suit a plain LAN deployment: multicast mDNS discovery and
/// in-memory preferences. Hosts provide their own preference store for
/// cross-process persistence, a gateway for app-to-app mode and a link
/// provider for cable mode.
pub struct TapLinkSdkBuilder {
    config: SdkConfig,
    lan_settings: LanSettings,
    store: Option<Arc<dyn PreferenceStore>>,
    browser: Option<Arc<dyn ServiceBrowser>>,
    host_gateway: Option<Arc<dyn HostAppGateway>>,
    cable_provider: Option<Arc<dyn CableLinkProvider>>,
}

impl TapLinkSdkBuilder {
    /// Starts a builder with the merchant identity.
    pub fn new(config: SdkConfig) -> Self {
        Self {
            config,
            lan_settings: LanSettings::default(),
            store: None,
            browser: None,
            host_gateway: None,
            cable_provider: None,
        }
    }

    /// Overrides the LAN tunables.
    pub fn lan_settings(mut self, settings: LanSettings) -> Self {
        self.lan_settings = settings;
        self
    }

    /// Uses the given preference store for the persisted snapshot.
    pub fn preference_store(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses the given service browser instead of multicast mDNS.
    pub fn service_browser(mut self, browser: Arc<dyn ServiceBrowser>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Enables the app-to-app transport through the given gateway.
    pub fn host_app_gateway(mut self, gateway: Arc<dyn HostAppGateway>) -> Self {
        self.host_gateway = Some(gateway);
        self
    }

    /// Enables the cable transport through the given link provider.
    pub fn cable_link_provider(mut self, provider: Arc<dyn CableLinkProvider>) -> Self {
        self.cable_provider = Some(provider);
        self
    }

    /// Assembles the SDK.
    pub fn build(self) -> TapLinkSdk {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryPreferenceStore::new()));
        let browser = self.browser.unwrap_or_else(|| Arc::new(MdnsBrowser));
        let registry = CallbackRegistry::new();
        let policy = ReconnectPolicy::new(Arc::clone(&store));
        let lan = LanTransport::new(self.lan_settings.clone(), browser);
        let app_to_app = self.host_gateway.map(AppToAppTransport::new);
        let cable = self
            .cable_provider
            .map(|provider| CableTransport::new(provider, Arc::clone(&store)));
        let connection = ConnectionManager::new(
            self.config.clone(),
            self.lan_settings,
            registry,
            policy,
            lan,
            app_to_app,
            cable,
        );
        let payments = PaymentManager::new(self.config, connection.clone());
        TapLinkSdk {
            connection,
            payments,
        }
    }
}

/// The SDK context.
///
/// One instance per process; there is no ambient singleton. Dropping the
/// instance after [`TapLinkSdk::shutdown`] releases every background task.
#[derive(Clone)]
pub struct TapLinkSdk {
    connection: ConnectionManager,
    payments: PaymentManager,
}

impl TapLinkSdk {
    /// Initializes the SDK with default platform pieces.
    pub fn init(config: SdkConfig) -> Self {
        TapLinkSdkBuilder::new(config).build()
    }

    /// Starts a builder for injecting platform pieces.
    pub fn builder(config: SdkConfig) -> TapLinkSdkBuilder {
        TapLinkSdkBuilder::new(config)
    }

    /// The connection state machine.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// The payment orchestrator.
    pub fn payments(&self) -> &PaymentManager {
        &self.payments
    }

    /// Connects with the given configuration, or the stored one when
    /// `config` is `None`.
    pub async fn connect(
        &self,
        config: Option<ConnectionConfig>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), types::error::TapError> {
        self.connection.connect(config, listener).await
    }

    /// Manual disconnect. Disarms auto-connect.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// `true` iff the INIT handshake completed for the current connection.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Identity of the connected terminal.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.connection.device_info()
    }

    /// The configuration auto-connect proposes on startup, if armed.
    pub fn startup_config(&self) -> Option<ConnectionConfig> {
        self.connection.startup_config()
    }

    /// Tears down supervisors and fails every outstanding call.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}
