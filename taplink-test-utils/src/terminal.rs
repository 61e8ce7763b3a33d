//! An in-process Tapro terminal.
//!
//! Serves the envelope protocol on a real `127.0.0.1` WebSocket so clients
//! dial it exactly like production hardware. Behaviour is scripted per
//! action: INIT outcome, progress sequences, terminal events, heartbeat
//! echo and connection drops are all under test control.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{self, WebSocket},
    },
    response::Response,
    routing::any,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use taplink_types::envelope::{Envelope, EventCode};
use tokio_util::sync::CancellationToken;

/// Reserved text prefix of heartbeat frames; replies echo the full body.
const HEARTBEAT_PREFIX: &str = "@taplink-hb/";

/// How the terminal answers a transaction request.
#[derive(Clone, Debug)]
pub enum TransactionScript {
    /// Send the given progress event codes, then `Completed` with a
    /// success `bizData`.
    Complete {
        /// Progress event codes sent before the terminal event.
        progress: Vec<u64>,
    },
    /// Send the given progress event codes, then go silent. Provokes the
    /// response-timeout path.
    ProgressThenSilence {
        /// Progress event codes sent before the silence.
        progress: Vec<u64>,
    },
    /// Send the given progress event codes, then `Cancel`.
    Cancel {
        /// Progress event codes sent before the terminal event.
        progress: Vec<u64>,
    },
}

/// Scripted behaviour of one emulated terminal.
#[derive(Clone, Debug)]
pub struct TerminalBehavior {
    /// The device id reported by INIT.
    pub device_id: String,
    /// The Tapro version reported by INIT.
    pub tapro_version: String,
    /// The `bizData.code` of the INIT reply; `100` means success.
    pub init_code: String,
    /// Whether heartbeat frames are echoed.
    pub echo_heartbeats: bool,
    /// Pause before the INIT reply, to hold clients in `CONNECTING`.
    pub init_delay: std::time::Duration,
    /// How transaction requests are answered.
    pub script: TransactionScript,
}

impl Default for TerminalBehavior {
    fn default() -> Self {
        Self {
            device_id: "D-7".to_string(),
            tapro_version: "2.4.1".to_string(),
            init_code: "100".to_string(),
            echo_heartbeats: true,
            init_delay: std::time::Duration::ZERO,
            script: TransactionScript::Complete {
                progress: vec![4000, 4001, 4002],
            },
        }
    }
}

struct TerminalState {
    behavior: TerminalBehavior,
    echo_heartbeats: AtomicBool,
    received: Mutex<Vec<Envelope>>,
    kick: Mutex<CancellationToken>,
    transaction_counter: AtomicU64,
}

/// A running emulated terminal.
pub struct EmulatedTerminal {
    port: u16,
    state: Arc<TerminalState>,
    cancel: CancellationToken,
}

impl EmulatedTerminal {
    /// Starts a terminal with the given behaviour on an ephemeral port.
    pub async fn spawn(behavior: TerminalBehavior) -> eyre::Result<Self> {
        let echo = behavior.echo_heartbeats;
        let state = Arc::new(TerminalState {
            behavior,
            echo_heartbeats: AtomicBool::new(echo),
            received: Mutex::new(Vec::new()),
            kick: Mutex::new(CancellationToken::new()),
            transaction_counter: AtomicU64::new(0),
        });
        let router = Router::new()
            .route("/", any(ws_handler))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let shutdown = async move { cancel.cancelled().await };
                if let Err(err) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::warn!("emulated terminal stopped: {err}");
                }
            }
        });
        tracing::debug!("emulated terminal listening on 127.0.0.1:{port}");
        Ok(Self {
            port,
            state,
            cancel,
        })
    }

    /// Starts a terminal with default behaviour.
    pub async fn spawn_default() -> eyre::Result<Self> {
        Self::spawn(TerminalBehavior::default()).await
    }

    /// The host clients should dial.
    pub fn host(&self) -> String {
        "127.0.0.1".to_string()
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every envelope the terminal received so far.
    pub fn received(&self) -> Vec<Envelope> {
        self.state.received.lock().clone()
    }

    /// Toggles heartbeat echoing at runtime.
    pub fn set_echo_heartbeats(&self, echo: bool) {
        self.state.echo_heartbeats.store(echo, Ordering::SeqCst);
    }

    /// Closes every open client connection. The listener stays up, so new
    /// dials succeed.
    pub fn disconnect_clients(&self) {
        let mut kick = self.state.kick.lock();
        kick.cancel();
        *kick = CancellationToken::new();
    }

    /// Stops the terminal.
    pub fn shutdown(&self) {
        self.state.kick.lock().cancel();
        self.cancel.cancel();
    }
}

impl Drop for EmulatedTerminal {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn ws_handler(
    State(state): State<Arc<TerminalState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_failed_upgrade(|err| tracing::warn!("could not establish websocket connection: {err:?}"))
        .on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<TerminalState>, mut socket: WebSocket) {
    let kick = state.kick.lock().clone();
    loop {
        let message = tokio::select! {
            _ = kick.cancelled() => {
                // best-effort closing handshake
                let _ = socket.send(ws::Message::Close(None)).await;
                return;
            }
            message = socket.recv() => message,
        };
        let frame = match message {
            Some(Ok(ws::Message::Text(text))) => text.to_string(),
            Some(Ok(ws::Message::Binary(bytes))) => {
                String::from_utf8_lossy(&bytes).to_string()
            }
            Some(Ok(ws::Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!("terminal read failed: {err}");
                return;
            }
        };
        if frame.starts_with(HEARTBEAT_PREFIX) {
            if state.echo_heartbeats.load(Ordering::SeqCst)
                && socket.send(ws::Message::Text(frame.into())).await.is_err()
            {
                return;
            }
            continue;
        }
        let envelope = match Envelope::decode(frame.as_bytes()) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("terminal dropping unparseable frame: {err}");
                continue;
            }
        };
        state.received.lock().push(envelope.clone());
        if respond(&state, &mut socket, &envelope).await.is_err() {
            return;
        }
    }
}

async fn respond(
    state: &TerminalState,
    socket: &mut WebSocket,
    request: &Envelope,
) -> Result<(), axum::Error> {
    if request.action == taplink_types::action::Action::Init {
        if !state.behavior.init_delay.is_zero() {
            tokio::time::sleep(state.behavior.init_delay).await;
        }
        let biz = json!({
            "code": state.behavior.init_code,
            "message": if state.behavior.init_code == "100" { "ok" } else { "init rejected" },
            "deviceId": state.behavior.device_id,
            "taproVersion": state.behavior.tapro_version,
            "transactionResultCode": "000",
        });
        return socket.send(reply(request, 4003, Some(biz))).await;
    }
    let script = state.behavior.script.clone();
    let (progress, terminal) = match script {
        TransactionScript::Complete { progress } => (progress, Some(4003)),
        TransactionScript::Cancel { progress } => (progress, Some(4004)),
        TransactionScript::ProgressThenSilence { progress } => (progress, None),
    };
    for code in progress {
        socket.send(reply(request, code, None)).await?;
    }
    if let Some(code) = terminal {
        let biz = match code {
            4003 => {
                let n = state.transaction_counter.fetch_add(1, Ordering::SeqCst) + 1;
                let reference = request
                    .biz_data
                    .as_ref()
                    .and_then(|biz| biz.get("referenceOrderId"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Some(json!({
                    "code": "100",
                    "transactionId": format!("T-{n}"),
                    "referenceOrderId": reference,
                }))
            }
            _ => None,
        };
        socket.send(reply(request, code, biz)).await?;
    }
    Ok(())
}

fn reply(request: &Envelope, event_code: u64, biz_data: Option<Value>) -> ws::Message {
    let envelope = Envelope {
        app_sign: "tapro".to_string(),
        version: request.version.clone(),
        time_stamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string(),
        action: request.action,
        trace_id: request.trace_id.clone(),
        biz_data,
        event_code: Some(EventCode::from(event_code)),
        event_msg: None,
    };
    let text = String::from_utf8(envelope.encode()).expect("envelope is UTF-8");
    ws::Message::Text(text.into())
}
