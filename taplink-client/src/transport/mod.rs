//! The transport abstraction.
//!
//! All three link types hide behind [`Transport`]: app-to-app IPC, the
//! USB/serial cable and WebSocket-over-LAN. The connection state machine
//! talks to this surface only; transport-specific supervision (heartbeat,
//! discovery) stays inside the LAN implementation.

use std::sync::Arc;

use async_trait::async_trait;
use taplink_types::{TraceId, error::TapError};

use crate::config::ConnectionConfig;

pub mod app_to_app;
pub mod cable;
pub mod lan;

/// The connection lifecycle states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No link.
    #[default]
    Disconnected,
    /// A connection attempt was accepted and waits to dial.
    WaitConnecting,
    /// The link is being established.
    Connecting,
    /// The link is up.
    Connected,
    /// The link or the attempt failed.
    Error,
}

impl ConnectionStatus {
    /// `true` for the states in which a reconnect proposal is acceptable
    /// under the unknown-device policy.
    pub fn is_down(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Error)
    }
}

/// Receives every inbound application frame.
pub type FrameReceiver = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Receives transport status transitions.
///
/// Never invoked re-entrantly under transport-internal locks.
pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// A byte-oriented link to the terminal.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the link described by `config`.
    async fn connect(&self, config: &ConnectionConfig) -> Result<(), TapError>;

    /// Tears the link down. Idempotent.
    async fn disconnect(&self);

    /// Writes one request frame.
    async fn send(&self, trace_id: &TraceId, bytes: Vec<u8>) -> Result<(), TapError>;

    /// Installs the inbound frame callback.
    ///
    /// The receiver sees every inbound frame except frames the transport
    /// owns itself (the LAN transport consumes its heartbeat replies).
    fn set_receiver(&self, receiver: FrameReceiver);

    /// Installs the status transition callback.
    fn set_status_listener(&self, listener: StatusListener);

    /// The current link status.
    fn status(&self) -> ConnectionStatus;
}

/// Shared listener/receiver plumbing used by all transport implementations.
#[derive(Default)]
pub(crate) struct TransportShared {
    receiver: parking_lot::Mutex<Option<FrameReceiver>>,
    status_listener: parking_lot::Mutex<Option<StatusListener>>,
    status: parking_lot::Mutex<ConnectionStatus>,
}

impl TransportShared {
    pub(crate) fn set_receiver(&self, receiver: FrameReceiver) {
        *self.receiver.lock() = Some(receiver);
    }

    pub(crate) fn set_status_listener(&self, listener: StatusListener) {
        *self.status_listener.lock() = Some(listener);
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Updates the status and notifies the listener outside the status lock.
    ///
    /// Returns `false` when the status did not change.
    pub(crate) fn transition(&self, next: ConnectionStatus) -> bool {
        let changed = {
            let mut status = self.status.lock();
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        };
        if changed {
            tracing::debug!("transport status -> {next:?}");
            let listener = self.status_listener.lock().clone();
            if let Some(listener) = listener {
                listener(next);
            }
        }
        changed
    }

    /// Hands an inbound frame to the registered receiver, if any.
    pub(crate) fn deliver(&self, frame: Vec<u8>) {
        let receiver = self.receiver.lock().clone();
        match receiver {
            Some(receiver) => receiver(frame),
            None => tracing::trace!("dropping frame, no receiver registered"),
        }
    }
}
