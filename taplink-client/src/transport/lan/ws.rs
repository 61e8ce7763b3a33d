//! Websocket dialing for the LAN transport.
//!
//! This module exposes a thin wrapper around a tungstenite web-socket
//! connection. The wrapper handles errors conservatively: anything
//! unexpected terminates the session, and the closing handshake is
//! implemented on a best-effort basis: we try to send `Close` frames when
//! we tear a connection down, but errors while doing so are ignored.

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt as _;
use taplink_types::error::{TapError, error_codes};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{self, http::Uri},
};

pub(crate) type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WebSocket, tungstenite::Message>;
pub(crate) type WsStream = SplitStream<WebSocket>;

/// One dialed web-socket connection.
pub(crate) struct WebSocketSession {
    pub(crate) endpoint: String,
    inner: WebSocket,
}

impl WebSocketSession {
    /// Forms the `ws`/`wss` URI for an endpoint.
    ///
    /// Fails with a format error when the pieces do not form a valid URI.
    pub(crate) fn endpoint_uri(host: &str, port: u16, secure: bool) -> Result<String, TapError> {
        let scheme = if secure { "wss" } else { "ws" };
        let endpoint = format!("{scheme}://{host}:{port}");
        endpoint.parse::<Uri>().map_err(|err| {
            TapError::with_message(
                error_codes::FORMAT_ERROR,
                format!("invalid endpoint {endpoint}: {err}"),
            )
        })?;
        Ok(endpoint)
    }

    /// Attempts a single dial to the endpoint.
    pub(crate) async fn dial(host: &str, port: u16, secure: bool) -> Result<Self, TapError> {
        let endpoint = Self::endpoint_uri(host, port, secure)?;
        tracing::debug!("dialing {endpoint}..");
        let (ws, _) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|err| {
                tracing::debug!("dial to {endpoint} failed: {err}");
                TapError::with_message(
                    error_codes::LAN_CANNOT_CONNECT,
                    format!("cannot connect to server at {endpoint}"),
                )
            })?;
        Ok(Self { endpoint, inner: ws })
    }

    /// Splits the session into independent write and read halves.
    pub(crate) fn split(self) -> (WsSink, WsStream) {
        self.inner.split()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn forms_plain_and_tls_uris() {
        assert_eq!(
            WebSocketSession::endpoint_uri("192.168.1.10", 8443, false).unwrap(),
            "ws://192.168.1.10:8443"
        );
        assert_eq!(
            WebSocketSession::endpoint_uri("tapro.local", 8444, true).unwrap(),
            "wss://tapro.local:8444"
        );
    }

    #[test]
    fn rejects_malformed_host() {
        let err = WebSocketSession::endpoint_uri("not a host", 8443, false).unwrap_err();
        assert_eq!(err.code, "302");
    }
}
