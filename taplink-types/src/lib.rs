#![deny(missing_docs)]
//! Core type definitions for the TapLink SDK.
//!
//! This crate groups together the strongly-typed values and message
//! structures exchanged between a merchant application and a Tapro payment
//! terminal. It provides:
//!
//! * The JSON wire envelope and its codec (see [`envelope`] module).
//! * The action and payment-event enumerations (see [`action`] and
//!   [`event`] modules).
//! * Transaction request payloads with their admission rules (see
//!   [`request`] and [`validation`] modules).
//! * The coded error catalogue with retry-class predicates (see [`error`]
//!   module).
//!
//! Use these types to pass, store, and (de)serialize requests and responses
//! in a type-safe way throughout your application. The envelope codec never
//! inspects `bizData` beyond passing it through as an opaque JSON subtree;
//! per-action payloads are parsed by the layer that owns them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod action;
pub mod envelope;
pub mod error;
pub mod event;
pub mod request;
pub mod validation;

/// Opaque identifier minted per outstanding request.
///
/// Responses and progress events are correlated with their request through
/// this value. The wire format only requires uniqueness across concurrently
/// outstanding requests; we mint UUIDv4 strings, which makes collisions a
/// fatal bug rather than an operational concern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Mints a fresh trace id.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing identifier, e.g. one read from the wire.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The id of a Tapro terminal, as reported by the INIT handshake.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps a terminal identifier.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
