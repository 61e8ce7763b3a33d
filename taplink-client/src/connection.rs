//! The connection state machine.
//!
//! This is the single source of truth for [`ConnectionStatus`]. The machine
//! derives its answer from the active transport's status combined with an
//! INIT-ready bit and the phase of the attempt in flight; there is no
//! mirrored status cache to reconcile. `CONNECTED` is reachable only after
//! the INIT handshake succeeds; a transport that is up without a
//! successful INIT is force-disconnected to restore consistency.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::Value;
use taplink_types::{
    DeviceId, TraceId,
    action::Action,
    error::{TapError, error_codes},
    event::PaymentEvent,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    callbacks::{ConnectionListener, DeviceInfo, DisconnectReason, TransactionCallback,
        TransactionResult},
    config::{ConnectionConfig, ConnectionMode, LanSettings, SdkConfig},
    dispatch::{build_envelope, handle_frame},
    registry::{CallKind, CallbackRegistry},
    transport::{
        ConnectionStatus, Transport,
        app_to_app::AppToAppTransport,
        cable::CableTransport,
        lan::{ConnectionLoss, LanTransport},
    },
};

/// Minimum device-match confidence for an address-change reconnect.
const ADDRESS_CHANGE_MIN_CONFIDENCE: f64 = 0.7;
/// Two address changes within this window collapse into one reconnect.
const ADDRESS_CHANGE_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Waiting,
    Dialing,
    Initing,
}

struct MachineState {
    phase: Phase,
    init_ready: bool,
    error: bool,
    active_config: Option<ConnectionConfig>,
}

struct ReconnectLoop {
    config: ConnectionConfig,
    cancel: CancellationToken,
    subscribers: Vec<Arc<dyn ConnectionListener>>,
}

/// Owns the connection lifecycle, the INIT handshake and the reconnect
/// policy decisions.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    sdk_config: SdkConfig,
    lan_settings: LanSettings,
    registry: CallbackRegistry,
    policy: crate::reconnect::ReconnectPolicy,
    lan: LanTransport,
    app_to_app: Option<AppToAppTransport>,
    cable: Option<CableTransport>,
    state: Mutex<MachineState>,
    global_listener: Mutex<Option<Arc<dyn ConnectionListener>>>,
    pending: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    reconnect: Mutex<Option<ReconnectLoop>>,
    device: Mutex<Option<DeviceInfo>>,
    last_accepted_change: Mutex<Option<Instant>>,
    attempt_epoch: AtomicU64,
}

impl ConnectionManager {
    /// Wires up the manager over its transports.
    pub(crate) fn new(
        sdk_config: SdkConfig,
        lan_settings: LanSettings,
        registry: CallbackRegistry,
        policy: crate::reconnect::ReconnectPolicy,
        lan: LanTransport,
        app_to_app: Option<AppToAppTransport>,
        cable: Option<CableTransport>,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            sdk_config,
            lan_settings,
            registry,
            policy,
            lan,
            app_to_app,
            cable,
            state: Mutex::new(MachineState {
                phase: Phase::Idle,
                init_ready: false,
                error: false,
                active_config: None,
            }),
            global_listener: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            reconnect: Mutex::new(None),
            device: Mutex::new(None),
            last_accepted_change: Mutex::new(None),
            attempt_epoch: AtomicU64::new(0),
        });
        inner.install();
        Self { inner }
    }

    /// Registers the global connection listener, replacing any previous one.
    pub fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self.inner.global_listener.lock() = Some(listener);
    }

    /// The machine's current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// `true` iff INIT completed successfully for the current attempt.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Identity of the connected terminal.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.inner.device.lock().clone()
    }

    /// The configuration to propose on startup, if auto-connect is armed.
    pub fn startup_config(&self) -> Option<ConnectionConfig> {
        self.inner.policy.startup_config()
    }

    /// Drives a connect with the explicit or stored configuration.
    pub async fn connect(
        &self,
        config: Option<ConnectionConfig>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), TapError> {
        let config = match config.or_else(|| self.inner.policy.last_connection_config()) {
            Some(config) => config,
            None => {
                let err = TapError::with_message(
                    error_codes::UNABLE_TO_CONNECT,
                    "no connection configuration provided or stored",
                );
                listener.on_error(&err);
                return Err(err);
            }
        };
        self.inner.connect_with(config, listener).await
    }

    /// Manual disconnect: tears the link down and disarms auto-connect.
    pub async fn disconnect(&self) {
        self.inner.disconnect(true, true).await;
    }

    pub(crate) fn registry(&self) -> &CallbackRegistry {
        &self.inner.registry
    }

    /// The transport carrying the active configuration, for the send path.
    pub(crate) fn active_transport(&self) -> Option<(Arc<dyn Transport>, ConnectionMode)> {
        let mode = self.inner.state.lock().active_config.as_ref()?.mode;
        let transport = self.inner.transport(mode).ok()?;
        Some((transport, mode))
    }

    /// Cancels supervisors and drains the registry. Terminal.
    pub async fn shutdown(&self) {
        self.inner.disconnect(false, false).await;
        self.inner
            .registry
            .fail_all(error_codes::DISCONNECTED, "SDK shut down");
    }

    /// The number of outstanding calls in the registry.
    pub fn outstanding_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// `true` while the LAN service monitor is running.
    pub fn is_lan_monitoring(&self) -> bool {
        self.inner.lan.is_monitoring()
    }
}

impl ManagerInner {
    fn install(self: &Arc<Self>) {
        let receiver = {
            let registry = self.registry.clone();
            Arc::new(move |bytes: Vec<u8>| handle_frame(&registry, bytes))
        };
        self.lan.set_receiver(receiver.clone());
        if let Some(app_to_app) = &self.app_to_app {
            app_to_app.set_receiver(receiver.clone());
        }
        if let Some(cable) = &self.cable {
            cable.set_receiver(receiver);
        }

        let weak = Arc::downgrade(self);
        for transport in self.transports() {
            let weak = Weak::clone(&weak);
            transport.set_status_listener(Arc::new(move |status| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_transport_status(status);
                }
            }));
        }

        let weak = Arc::downgrade(self);
        self.lan.set_connection_lost_listener(Arc::new(move |error, loss| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_connection_loss(error, loss);
            }
        }));

        let weak = Arc::downgrade(self);
        self.lan.set_address_change_listener(Arc::new(
            move |name, new_host, new_port, old_host, old_port| {
                weak.upgrade().is_some_and(|inner| {
                    inner.evaluate_address_change(name, new_host, new_port, old_host, old_port)
                })
            },
        ));

        let weak = Arc::downgrade(self);
        self.lan
            .set_reconnect_request_listener(Arc::new(move |host, port| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_monitor_reconnect(host, port);
                }
            }));
    }

    fn transports(&self) -> Vec<Arc<dyn Transport>> {
        let mut transports: Vec<Arc<dyn Transport>> = vec![Arc::new(self.lan.clone())];
        if let Some(app_to_app) = &self.app_to_app {
            transports.push(Arc::new(app_to_app.clone()));
        }
        if let Some(cable) = &self.cable {
            transports.push(Arc::new(cable.clone()));
        }
        transports
    }

    fn transport(&self, mode: ConnectionMode) -> Result<Arc<dyn Transport>, TapError> {
        match mode {
            ConnectionMode::Lan => Ok(Arc::new(self.lan.clone())),
            ConnectionMode::AppToApp => self
                .app_to_app
                .clone()
                .map(|transport| Arc::new(transport) as Arc<dyn Transport>)
                .ok_or_else(|| TapError::from_code(error_codes::HOST_APP_MISSING)),
            ConnectionMode::Cable => self
                .cable
                .clone()
                .map(|transport| Arc::new(transport) as Arc<dyn Transport>)
                .ok_or_else(|| TapError::from_code(error_codes::CABLE_NOT_ATTACHED)),
        }
    }

    fn status(&self) -> ConnectionStatus {
        let (phase, init_ready, error, mode) = {
            let state = self.state.lock();
            (
                state.phase,
                state.init_ready,
                state.error,
                state.active_config.as_ref().map(|config| config.mode),
            )
        };
        match phase {
            Phase::Waiting => return ConnectionStatus::WaitConnecting,
            Phase::Dialing | Phase::Initing => return ConnectionStatus::Connecting,
            Phase::Idle => {}
        }
        if error {
            return ConnectionStatus::Error;
        }
        let transport_status = mode
            .and_then(|mode| self.transport(mode).ok())
            .map(|transport| transport.status())
            .unwrap_or(ConnectionStatus::Disconnected);
        match transport_status {
            ConnectionStatus::Connected if init_ready => ConnectionStatus::Connected,
            // transport up without INIT: never promoted
            ConnectionStatus::Connected => ConnectionStatus::Error,
            other => other,
        }
    }

    async fn connect_with(
        self: &Arc<Self>,
        config: ConnectionConfig,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), TapError> {
        // an active reconnect loop either adopts the caller or is replaced
        let mut listener = Some(listener);
        let stale_loop = {
            let mut guard = self.reconnect.lock();
            let equivalent = guard
                .as_ref()
                .is_some_and(|active| active.config.is_equivalent(&config));
            if equivalent {
                if let Some(active) = guard.as_mut()
                    && let Some(listener) = listener.take()
                {
                    active.subscribers.push(listener);
                }
                None
            } else {
                guard.take()
            }
        };
        let Some(listener) = listener else {
            // adopted by the running loop
            return Ok(());
        };
        if let Some(stale) = stale_loop {
            stale.cancel.cancel();
            self.disconnect(false, false).await;
        }

        match self.status() {
            ConnectionStatus::Connected => {
                let same = self
                    .state
                    .lock()
                    .active_config
                    .as_ref()
                    .is_some_and(|active| active.is_equivalent(&config));
                if same {
                    if let Some(device) = self.device.lock().clone() {
                        listener.on_connected(&device);
                    }
                    return Ok(());
                }
                self.disconnect(false, false).await;
            }
            ConnectionStatus::WaitConnecting | ConnectionStatus::Connecting => {
                self.pending.lock().push(listener);
                return Ok(());
            }
            _ => {}
        }
        self.drive_attempt(config, Some(listener)).await
    }

    /// One full connection attempt: dial, INIT, promote.
    async fn drive_attempt(
        self: &Arc<Self>,
        config: ConnectionConfig,
        listener: Option<Arc<dyn ConnectionListener>>,
    ) -> Result<(), TapError> {
        let epoch = self.attempt_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(listener) = listener {
            self.pending.lock().push(listener);
        }
        {
            let mut state = self.state.lock();
            state.phase = Phase::Waiting;
            state.init_ready = false;
            state.error = false;
            state.active_config = Some(config.clone());
        }
        self.notify_waiting();

        let transport = match self.transport(config.mode) {
            Ok(transport) => transport,
            Err(err) => return self.fail_attempt(epoch, err),
        };
        self.set_phase(Phase::Dialing);
        if let Err(err) = transport.connect(&config).await {
            return self.fail_attempt(epoch, err);
        }
        if self.stale(epoch) {
            return Err(superseded());
        }

        self.set_phase(Phase::Initing);
        match self.run_init(transport.as_ref(), config.mode).await {
            Ok(device) => {
                if self.stale(epoch) {
                    transport.disconnect().await;
                    return Err(superseded());
                }
                {
                    let mut state = self.state.lock();
                    state.phase = Phase::Idle;
                    state.init_ready = true;
                    state.error = false;
                }
                *self.device.lock() = Some(device.clone());
                self.policy.remember_connection(&config, &device.device_id);
                tracing::info!(
                    "connected to {} (tapro {})",
                    device.device_id,
                    device.tapro_version
                );
                self.notify_connected(&device);
                Ok(())
            }
            Err(err) => {
                // INIT failure: the socket must not stay up
                transport.disconnect().await;
                self.device.lock().take();
                self.registry.fail_all(&err.code, &err.message);
                self.fail_attempt(epoch, err)
            }
        }
    }

    fn fail_attempt(&self, epoch: u64, err: TapError) -> Result<(), TapError> {
        if self.stale(epoch) {
            // superseded attempts end silently
            return Err(err);
        }
        {
            let mut state = self.state.lock();
            state.phase = Phase::Idle;
            state.init_ready = false;
            state.error = true;
        }
        tracing::warn!("connection attempt failed: {err}");
        self.notify_error(&err);
        Err(err)
    }

    /// Sends the INIT envelope and awaits its terminal event.
    async fn run_init(
        &self,
        transport: &dyn Transport,
        mode: ConnectionMode,
    ) -> Result<DeviceInfo, TapError> {
        let trace_id = TraceId::mint();
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(OneshotCompletion::new(tx));
        let registered = match mode {
            ConnectionMode::AppToApp => {
                self.registry
                    .register_host_driven(trace_id.clone(), completion, CallKind::Init)
            }
            _ => self
                .registry
                .register(trace_id.clone(), completion, CallKind::Init, None),
        };
        if !registered {
            return Err(TapError::from_code(error_codes::SERVICE_EXCEPTION));
        }
        let envelope = build_envelope(
            &self.sdk_config,
            Action::Init,
            &trace_id,
            Some(Value::Object(Default::default())),
        );
        tracing::debug!("sending INIT as {trace_id}");
        if let Err(err) = transport.send(&trace_id, envelope.encode()).await {
            self.registry.cancel(&trace_id);
            return Err(err);
        }
        let result = match rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(TapError::from_code(error_codes::SERVICE_EXCEPTION)),
        };
        let device_id = result
            .extra
            .get("deviceId")
            .and_then(Value::as_str)
            .map(DeviceId::new)
            .ok_or_else(|| {
                TapError::with_message(
                    error_codes::INIT_FAILED,
                    "INIT response carries no deviceId",
                )
            })?;
        let tapro_version = result
            .extra
            .get("taproVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Ok(DeviceInfo {
            device_id,
            tapro_version,
        })
    }

    async fn disconnect(&self, notify: bool, clear_intent: bool) {
        self.attempt_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = self.reconnect.lock().take() {
            active.cancel.cancel();
        }
        // reset the machine before the transport drops, so the status
        // transition is not mistaken for a passive loss
        let mode = {
            let mut state = self.state.lock();
            let mode = state.active_config.as_ref().map(|config| config.mode);
            state.phase = Phase::Idle;
            state.init_ready = false;
            state.error = false;
            state.active_config = None;
            mode
        };
        if let Some(mode) = mode
            && let Ok(transport) = self.transport(mode)
        {
            transport.disconnect().await;
        }
        self.device.lock().take();
        self.registry
            .fail_all(error_codes::DISCONNECTED, "disconnected");
        if clear_intent {
            self.policy.clear_auto_connect();
        }
        if notify {
            let listeners = self.notification_set(true, true);
            for listener in listeners {
                listener.on_disconnected(&DisconnectReason::Manual);
            }
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.state.lock().phase = phase;
    }

    fn stale(&self, epoch: u64) -> bool {
        self.attempt_epoch.load(Ordering::SeqCst) != epoch
    }

    /// Snapshot of everyone awaiting the current attempt, deduplicated.
    ///
    /// `drain_pending` empties the pending queue; `drain_loop` additionally
    /// empties the reconnect-loop subscriber list. Loop subscribers only
    /// leave on a successful attempt; an intermediate retry failure is not
    /// their final answer.
    fn notification_set(
        &self,
        drain_pending: bool,
        drain_loop: bool,
    ) -> Vec<Arc<dyn ConnectionListener>> {
        let mut listeners: Vec<Arc<dyn ConnectionListener>> = Vec::new();
        {
            let mut pending = self.pending.lock();
            if drain_pending {
                listeners.append(&mut pending);
            } else {
                listeners.extend(pending.iter().cloned());
            }
        }
        if drain_loop
            && let Some(active) = self.reconnect.lock().as_mut()
        {
            listeners.append(&mut active.subscribers);
        }
        if let Some(global) = self.global_listener.lock().clone() {
            listeners.push(global);
        }
        // a listener appearing in several roles is notified once
        let mut unique: Vec<Arc<dyn ConnectionListener>> = Vec::with_capacity(listeners.len());
        for listener in listeners {
            if !unique.iter().any(|seen| Arc::ptr_eq(seen, &listener)) {
                unique.push(listener);
            }
        }
        unique
    }

    fn notify_waiting(&self) {
        for listener in self.notification_set(false, false) {
            listener.on_waiting_connect();
        }
    }

    fn notify_connected(&self, device: &DeviceInfo) {
        for listener in self.notification_set(true, true) {
            listener.on_connected(device);
        }
    }

    fn notify_error(&self, error: &TapError) {
        for listener in self.notification_set(true, false) {
            listener.on_error(error);
        }
    }

    fn notify_global_error(&self, error: &TapError) {
        if let Some(global) = self.global_listener.lock().clone() {
            global.on_error(error);
        }
    }

    /// Reacts to raw transport transitions: refuses to promote a transport
    /// that is up without INIT, and notices silent drops of non-LAN links.
    fn on_transport_status(self: &Arc<Self>, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connected => {
                let refuse = {
                    let state = self.state.lock();
                    state.phase == Phase::Idle && !state.init_ready
                };
                if refuse {
                    tracing::warn!("transport connected without INIT, forcing disconnect");
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        let mode = {
                            let state = inner.state.lock();
                            state.active_config.as_ref().map(|config| config.mode)
                        };
                        if let Some(mode) = mode
                            && let Ok(transport) = inner.transport(mode)
                        {
                            transport.disconnect().await;
                        }
                    });
                }
            }
            ConnectionStatus::Disconnected => {
                // LAN losses arrive through the connection-lost listener;
                // this covers the in-process and cable links
                let was_app_or_cable = {
                    let state = self.state.lock();
                    state.init_ready
                        && state
                            .active_config
                            .as_ref()
                            .is_some_and(|config| config.mode != ConnectionMode::Lan)
                };
                if was_app_or_cable {
                    self.handle_connection_loss(
                        TapError::from_code(error_codes::DISCONNECTED),
                        ConnectionLoss::Passive,
                    );
                }
            }
            _ => {}
        }
    }

    /// An established connection dropped without a manual disconnect.
    fn handle_connection_loss(self: &Arc<Self>, error: TapError, loss: ConnectionLoss) {
        let was_ready = {
            let mut state = self.state.lock();
            let was_ready = state.init_ready;
            if was_ready {
                state.init_ready = false;
                state.error = true;
            }
            was_ready
        };
        // drain outstanding calls first so an in-flight INIT fails fast
        self.registry.fail_all(&error.code, &error.message);
        if !was_ready {
            // the rest of the loss handling surfaces through the attempt
            return;
        }
        self.device.lock().take();
        self.notify_global_error(&error);
        match loss {
            // the service monitor keeps running; rediscovery of the device
            // proposes the reconnect
            ConnectionLoss::Heartbeat => {}
            ConnectionLoss::Passive => {
                let config = self.state.lock().active_config.clone();
                if let Some(config) = config
                    && self.policy.auto_connect_enabled()
                {
                    self.start_reconnect_loop(config);
                }
            }
        }
    }

    /// Retries the last configuration with 1s/2s/4s pauses.
    fn start_reconnect_loop(self: &Arc<Self>, config: ConnectionConfig) {
        let cancel = CancellationToken::new();
        {
            let mut guard = self.reconnect.lock();
            if guard.is_some() {
                return;
            }
            *guard = Some(ReconnectLoop {
                config: config.clone(),
                cancel: cancel.clone(),
                subscribers: Vec::new(),
            });
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let max_retries = inner.lan_settings.reconnect_max_retries;
            let mut delay = Duration::from_secs(1);
            let mut last_error = TapError::from_code(error_codes::UNABLE_TO_CONNECT);
            for attempt in 1..=max_retries {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = delay.saturating_mul(2);
                inner.registry.broadcast_progress(PaymentEvent::Reconnecting {
                    attempt,
                    max_retries,
                });
                tracing::info!("reconnect attempt {attempt}/{max_retries}");
                match inner.drive_attempt(config.clone(), None).await {
                    Ok(()) => {
                        inner.reconnect.lock().take();
                        return;
                    }
                    Err(err) => last_error = err,
                }
                if cancel.is_cancelled() {
                    return;
                }
            }
            // exhausted: anyone subscribed to the loop learns the outcome
            let subscribers = inner
                .reconnect
                .lock()
                .take()
                .map(|active| active.subscribers)
                .unwrap_or_default();
            for subscriber in subscribers {
                subscriber.on_error(&last_error);
            }
        });
    }

    /// The four ordered checks of the address-change decision.
    fn evaluate_address_change(
        self: &Arc<Self>,
        service_name: &str,
        new_host: &str,
        new_port: u16,
        old_host: &str,
        old_port: u16,
    ) -> bool {
        // 1. device identity
        let known_id = self
            .device
            .lock()
            .as_ref()
            .map(|device| device.device_id.clone())
            .or_else(|| self.policy.connected_device_id());
        let status = self.status();
        let confidence = match &known_id {
            Some(id) => match device_match_confidence(service_name, id.as_str()) {
                DeviceMatch::Different => {
                    tracing::debug!("{service_name} belongs to another device, ignoring");
                    return false;
                }
                DeviceMatch::Confidence(confidence) => {
                    if confidence >= 0.6 {
                        self.policy
                            .remember_service(id.as_str(), service_name, new_host, new_port);
                    }
                    confidence
                }
            },
            None => {
                // unknown device: conservative policy
                if status.is_down() && service_name.contains("Tapro") {
                    ADDRESS_CHANGE_MIN_CONFIDENCE
                } else {
                    return false;
                }
            }
        };
        if confidence < ADDRESS_CHANGE_MIN_CONFIDENCE {
            return false;
        }

        // 2. the address must actually change while we are up
        let unchanged = new_host == old_host && new_port == old_port;
        if unchanged
            && matches!(
                status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            )
        {
            return false;
        }

        // 3. not already connected to the advertised endpoint
        if status == ConnectionStatus::Connected
            && self.lan.current_endpoint() == Some((new_host.to_string(), new_port))
        {
            return false;
        }

        // 4. debounce
        {
            let mut last = self.last_accepted_change.lock();
            if last.is_some_and(|at| at.elapsed() < ADDRESS_CHANGE_DEBOUNCE) {
                tracing::debug!("address change within debounce window, skipping");
                return false;
            }
            *last = Some(Instant::now());
        }

        true
    }

    /// The continuous monitor accepted an address change; reconnect to the
    /// advertised endpoint.
    fn handle_monitor_reconnect(self: &Arc<Self>, host: String, port: u16) {
        let secure = self
            .state
            .lock()
            .active_config
            .as_ref()
            .map(|config| config.secure)
            .unwrap_or(false);
        let target = ConnectionConfig::lan(host.clone(), port, secure);
        tracing::info!("reconnecting to advertised endpoint {host}:{port}");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.registry.broadcast_progress(PaymentEvent::Reconnecting {
                attempt: 1,
                max_retries: 1,
            });
            Transport::disconnect(&inner.lan).await;
            let _ = inner.drive_attempt(target, None).await;
        });
    }
}

fn superseded() -> TapError {
    TapError::with_message(error_codes::UNABLE_TO_CONNECT, "connect attempt superseded")
}

enum DeviceMatch {
    Confidence(f64),
    Different,
}

/// Scores how strongly an advertised service name matches a device id.
fn device_match_confidence(service_name: &str, device_id: &str) -> DeviceMatch {
    let exact = format!("TaproService_{device_id}");
    if service_name == exact {
        return DeviceMatch::Confidence(1.0);
    }
    if let Some(advertised) = service_name.strip_prefix("TaproService_") {
        // the canonical prefix with someone else's id is another terminal
        if advertised != device_id {
            return DeviceMatch::Different;
        }
    }
    if service_name.ends_with(&format!("_{device_id}")) {
        return DeviceMatch::Confidence(0.8);
    }
    if service_name.contains(device_id) && service_name.contains("Tapro") {
        return DeviceMatch::Confidence(0.6);
    }
    DeviceMatch::Confidence(0.0)
}

/// Adapter that resolves a oneshot with the call's terminal outcome.
struct OneshotCompletion {
    tx: Mutex<Option<oneshot::Sender<Result<TransactionResult, TapError>>>>,
}

impl OneshotCompletion {
    fn new(tx: oneshot::Sender<Result<TransactionResult, TapError>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn resolve(&self, outcome: Result<TransactionResult, TapError>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

impl TransactionCallback for OneshotCompletion {
    fn on_success(&self, result: TransactionResult) {
        self.resolve(Ok(result));
    }

    fn on_failure(&self, error: TapError) {
        self.resolve(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_service_name_scores_full_confidence() {
        assert!(matches!(
            device_match_confidence("TaproService_D-7", "D-7"),
            DeviceMatch::Confidence(c) if c == 1.0
        ));
    }

    #[test]
    fn canonical_prefix_with_other_id_is_another_device() {
        assert!(matches!(
            device_match_confidence("TaproService_D-9", "D-7"),
            DeviceMatch::Different
        ));
    }

    #[test]
    fn suffix_and_loose_matches_score_lower() {
        assert!(matches!(
            device_match_confidence("terminal_D-7", "D-7"),
            DeviceMatch::Confidence(c) if c == 0.8
        ));
        assert!(matches!(
            device_match_confidence("Tapro kiosk D-7 east", "D-7"),
            DeviceMatch::Confidence(c) if c == 0.6
        ));
        assert!(matches!(
            device_match_confidence("SomethingElse", "D-7"),
            DeviceMatch::Confidence(c) if c == 0.0
        ));
    }
}
