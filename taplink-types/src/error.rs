//! The coded error catalogue and its retry-class predicates.
//!
//! Errors live in a flat string namespace; the category is derived from the
//! numeric range. The retry predicates are pure functions on the code so
//! callers can drive their own retry UX without consulting the SDK.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TraceId;

/// TapLink error codes as they appear on the wire and in [`TapError::code`].
pub mod error_codes {
    /// Success.
    pub const SUCCESS: &str = "100";
    /// The SDK has not been initialized.
    pub const SDK_NOT_INITIALIZED: &str = "201";
    /// Internal service exception.
    pub const SERVICE_EXCEPTION: &str = "202";
    /// Initialization handshake failed.
    pub const INIT_FAILED: &str = "203";
    /// Already connected to a terminal.
    pub const ALREADY_CONNECTED: &str = "211";
    /// No terminal connected.
    pub const NOT_CONNECTED: &str = "212";
    /// The connection to the terminal was lost.
    pub const DISCONNECTED: &str = "213";
    /// Unable to establish a connection.
    pub const UNABLE_TO_CONNECT: &str = "214";
    /// Authentication with the terminal failed.
    pub const AUTH_FAILED: &str = "221";
    /// The host application is not installed.
    pub const HOST_APP_MISSING: &str = "231";
    /// The host application cannot be reached.
    pub const HOST_APP_UNREACHABLE: &str = "232";
    /// Cannot connect to the LAN server.
    pub const LAN_CANNOT_CONNECT: &str = "241";
    /// Service discovery found no terminal.
    pub const LAN_DISCOVERY_EMPTY: &str = "242";
    /// No cable attached.
    pub const CABLE_NOT_ATTACHED: &str = "251";
    /// Cable permission denied.
    pub const CABLE_PERMISSION_DENIED: &str = "252";
    /// Cable operation timed out.
    pub const CABLE_TIMEOUT: &str = "253";
    /// Unsupported cable protocol.
    pub const CABLE_UNSUPPORTED_PROTOCOL: &str = "254";
    /// Cable device not ready.
    pub const CABLE_DEVICE_NOT_READY: &str = "255";
    /// A required parameter is missing.
    pub const MISSING_PARAM: &str = "301";
    /// A parameter has an invalid format.
    pub const FORMAT_ERROR: &str = "302";
    /// The action is not supported by the terminal.
    pub const UNSUPPORTED_ACTION: &str = "303";
    /// Sending the request failed.
    pub const SEND_FAILED: &str = "304";
    /// Another transaction is in progress.
    pub const IN_PROGRESS: &str = "305";
    /// No response before the deadline.
    pub const RESPONSE_TIMEOUT: &str = "306";
    /// The terminal rejected the transaction.
    pub const REJECTED: &str = "307";
    /// The transaction is still processing.
    pub const PROCESSING: &str = "308";
    /// The transaction was terminated.
    pub const TERMINATED: &str = "309";
    /// Insufficient balance.
    pub const INSUFFICIENT_BALANCE: &str = "310";
    /// Password error.
    pub const PASSWORD_ERROR: &str = "311";
    /// The query could not be answered.
    pub const QUERY_FAILED: &str = "312";
    /// Generic transaction failure.
    pub const GENERIC: &str = "399";
}

/// Success codes accepted on decode. Only `100` is ever emitted.
pub const ACCEPTED_SUCCESS_CODES: [&str; 3] = ["100", "0", "000"];

/// Returns `true` iff `code` denotes success, accepting the legacy forms.
pub fn is_success_code(code: &str) -> bool {
    ACCEPTED_SUCCESS_CODES.contains(&code)
}

/// The category an error code belongs to, derived from its numeric range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Code 100.
    Success,
    /// Codes 201–203.
    Initialization,
    /// Codes 211–214.
    ConnectionState,
    /// Code 221.
    Authentication,
    /// Codes 231–232.
    AppToApp,
    /// Codes 241–242.
    Lan,
    /// Codes 251–255.
    Cable,
    /// Codes 301–312 and 399.
    Transaction,
    /// Anything else, including non-numeric codes.
    Unknown,
}

/// Derives the [`ErrorCategory`] of a code.
pub fn category(code: &str) -> ErrorCategory {
    if is_success_code(code) {
        return ErrorCategory::Success;
    }
    match code.parse::<u16>() {
        Ok(201..=203) => ErrorCategory::Initialization,
        Ok(211..=214) => ErrorCategory::ConnectionState,
        Ok(221) => ErrorCategory::Authentication,
        Ok(231..=232) => ErrorCategory::AppToApp,
        Ok(241..=242) => ErrorCategory::Lan,
        Ok(251..=255) => ErrorCategory::Cable,
        Ok(301..=312) | Ok(399) => ErrorCategory::Transaction,
        _ => ErrorCategory::Unknown,
    }
}

/// `true` iff a retry may reuse the same reference order id.
pub fn can_retry_with_same_id(code: &str) -> bool {
    !matches!(code, "306" | "307" | "308")
}

/// `true` iff a retry must mint a new reference order id.
pub fn must_use_new_id(code: &str) -> bool {
    matches!(code, "307" | "310" | "311")
}

/// `true` iff the caller should query the transaction state before retrying.
pub fn needs_query_before_retry(code: &str) -> bool {
    matches!(code, "306" | "308")
}

/// `true` iff the transaction must not be retried at all.
pub fn should_not_retry(code: &str) -> bool {
    code == "309"
}

/// The catalogue's default message for a code, if the code is known.
pub fn default_message(code: &str) -> Option<&'static str> {
    let message = match code {
        error_codes::SUCCESS => "success",
        error_codes::SDK_NOT_INITIALIZED => "SDK not initialized",
        error_codes::SERVICE_EXCEPTION => "service exception",
        error_codes::INIT_FAILED => "terminal initialization failed",
        error_codes::ALREADY_CONNECTED => "already connected",
        error_codes::NOT_CONNECTED => "device not connected",
        error_codes::DISCONNECTED => "connection lost",
        error_codes::UNABLE_TO_CONNECT => "unable to connect",
        error_codes::AUTH_FAILED => "authentication failed",
        error_codes::HOST_APP_MISSING => "host application not installed",
        error_codes::HOST_APP_UNREACHABLE => "cannot reach host application",
        error_codes::LAN_CANNOT_CONNECT => "cannot connect to server",
        error_codes::LAN_DISCOVERY_EMPTY => "no terminal discovered",
        error_codes::CABLE_NOT_ATTACHED => "cable not attached",
        error_codes::CABLE_PERMISSION_DENIED => "cable permission denied",
        error_codes::CABLE_TIMEOUT => "cable timeout",
        error_codes::CABLE_UNSUPPORTED_PROTOCOL => "unsupported cable protocol",
        error_codes::CABLE_DEVICE_NOT_READY => "cable device not ready",
        error_codes::MISSING_PARAM => "missing parameter",
        error_codes::FORMAT_ERROR => "parameter format error",
        error_codes::UNSUPPORTED_ACTION => "unsupported action",
        error_codes::SEND_FAILED => "send failed",
        error_codes::IN_PROGRESS => "transaction in progress",
        error_codes::RESPONSE_TIMEOUT => "response timeout",
        error_codes::REJECTED => "transaction rejected",
        error_codes::PROCESSING => "transaction processing",
        error_codes::TERMINATED => "transaction terminated",
        error_codes::INSUFFICIENT_BALANCE => "insufficient balance",
        error_codes::PASSWORD_ERROR => "password error",
        error_codes::QUERY_FAILED => "query failed",
        error_codes::GENERIC => "transaction failed",
        _ => return None,
    };
    Some(message)
}

/// The catalogue's suggestion for a code, where one exists.
pub fn suggestion(code: &str) -> Option<&'static str> {
    let suggestion = match code {
        error_codes::NOT_CONNECTED => "connect to a terminal before sending transactions",
        error_codes::DISCONNECTED => "wait for the automatic reconnect or connect manually",
        error_codes::LAN_CANNOT_CONNECT => "check that the terminal is reachable on the network",
        error_codes::LAN_DISCOVERY_EMPTY => "check that the terminal is powered and on the same network",
        error_codes::RESPONSE_TIMEOUT => "query the transaction state before retrying",
        error_codes::PROCESSING => "query the transaction state before retrying",
        error_codes::REJECTED => "retry with a new reference order id",
        error_codes::TERMINATED => "do not retry this transaction",
        _ => return None,
    };
    Some(suggestion)
}

/// A coded SDK error.
///
/// Carries the catalogue code plus optional correlation identifiers for the
/// affected transaction.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct TapError {
    /// The catalogue code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Actionable hint for the caller, where the catalogue has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// The trace id of the affected request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// The merchant reference of the affected transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_order_id: Option<String>,
    /// The terminal-assigned transaction id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl TapError {
    /// Builds an error from a catalogue code, using the default message.
    pub fn from_code(code: &str) -> Self {
        Self {
            code: code.to_string(),
            message: default_message(code).unwrap_or("unknown error").to_string(),
            suggestion: suggestion(code).map(str::to_string),
            trace_id: None,
            reference_order_id: None,
            transaction_id: None,
        }
    }

    /// Builds an error with an explicit message.
    pub fn with_message(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::from_code(code)
        }
    }

    /// Attaches the trace id of the affected request.
    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Attaches the merchant reference of the affected transaction.
    pub fn with_reference_order_id(mut self, reference_order_id: impl Into<String>) -> Self {
        self.reference_order_id = Some(reference_order_id.into());
        self
    }

    /// The derived category of this error.
    pub fn category(&self) -> ErrorCategory {
        category(&self.code)
    }

    /// `true` iff a retry may reuse the same reference order id.
    pub fn can_retry_with_same_id(&self) -> bool {
        can_retry_with_same_id(&self.code)
    }

    /// `true` iff a retry must mint a new reference order id.
    pub fn must_use_new_id(&self) -> bool {
        must_use_new_id(&self.code)
    }

    /// `true` iff the caller should query the transaction state first.
    pub fn needs_query_before_retry(&self) -> bool {
        needs_query_before_retry(&self.code)
    }

    /// `true` iff the transaction must not be retried.
    pub fn should_not_retry(&self) -> bool {
        should_not_retry(&self.code)
    }
}

/// Derived retry class of an error code, for display and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry allowed, same reference order id.
    SameId,
    /// Retry allowed, new reference order id required.
    NewId,
    /// Query the transaction state before deciding.
    QueryFirst,
    /// Do not retry.
    Never,
}

impl RetryClass {
    /// Classifies a code into the dominant retry class.
    ///
    /// Query-first wins over the id rules because an in-doubt transaction
    /// must be resolved before any retry is safe.
    pub fn of(code: &str) -> Self {
        if should_not_retry(code) {
            RetryClass::Never
        } else if needs_query_before_retry(code) {
            RetryClass::QueryFirst
        } else if must_use_new_id(code) {
            RetryClass::NewId
        } else {
            RetryClass::SameId
        }
    }
}

impl fmt::Display for RetryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RetryClass::SameId => "retry-same-id",
            RetryClass::NewId => "retry-new-id",
            RetryClass::QueryFirst => "query-first",
            RetryClass::Never => "no-retry",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_ranges() {
        assert_eq!(category("100"), ErrorCategory::Success);
        assert_eq!(category("0"), ErrorCategory::Success);
        assert_eq!(category("000"), ErrorCategory::Success);
        assert_eq!(category("203"), ErrorCategory::Initialization);
        assert_eq!(category("213"), ErrorCategory::ConnectionState);
        assert_eq!(category("221"), ErrorCategory::Authentication);
        assert_eq!(category("232"), ErrorCategory::AppToApp);
        assert_eq!(category("241"), ErrorCategory::Lan);
        assert_eq!(category("255"), ErrorCategory::Cable);
        assert_eq!(category("306"), ErrorCategory::Transaction);
        assert_eq!(category("399"), ErrorCategory::Transaction);
        assert_eq!(category("777"), ErrorCategory::Unknown);
        assert_eq!(category("WAT"), ErrorCategory::Unknown);
    }

    #[test]
    fn retry_predicates() {
        assert!(!can_retry_with_same_id("306"));
        assert!(!can_retry_with_same_id("307"));
        assert!(!can_retry_with_same_id("308"));
        assert!(can_retry_with_same_id("304"));

        assert!(must_use_new_id("307"));
        assert!(must_use_new_id("310"));
        assert!(must_use_new_id("311"));
        assert!(!must_use_new_id("306"));

        assert!(needs_query_before_retry("306"));
        assert!(needs_query_before_retry("308"));
        assert!(!needs_query_before_retry("307"));

        assert!(should_not_retry("309"));
        assert!(!should_not_retry("308"));
    }

    #[test]
    fn retry_class_prefers_query_first() {
        assert_eq!(RetryClass::of("306"), RetryClass::QueryFirst);
        assert_eq!(RetryClass::of("307"), RetryClass::NewId);
        assert_eq!(RetryClass::of("309"), RetryClass::Never);
        assert_eq!(RetryClass::of("304"), RetryClass::SameId);
    }

    #[test]
    fn from_code_uses_catalogue_defaults() {
        let err = TapError::from_code(error_codes::RESPONSE_TIMEOUT);
        assert_eq!(err.code, "306");
        assert_eq!(err.message, "response timeout");
        assert!(err.suggestion.is_some());
    }
}
