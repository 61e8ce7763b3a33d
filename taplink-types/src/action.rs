//! The action enumeration carried in every envelope.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The application-layer operation an envelope requests or answers.
///
/// Wire names are the upper-snake forms, e.g. `FORCED_AUTH`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// The first request after a transport is up; gates business-ready status.
    Init,
    /// A sale (purchase) transaction.
    Sale,
    /// A pre-authorization.
    Auth,
    /// A forced (offline) authorization.
    ForcedAuth,
    /// Capture of a prior authorization.
    PostAuth,
    /// Increment of a prior authorization.
    IncrementAuth,
    /// A referenced or non-referenced refund.
    Refund,
    /// Void of a prior transaction.
    Void,
    /// Tip adjustment on a prior transaction.
    TipAdjust,
    /// Status query for a prior transaction.
    Query,
    /// Batch close (settlement).
    BatchClose,
    /// Abort of an in-flight transaction.
    Abort,
}

impl Action {
    /// Returns the wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Init => "INIT",
            Action::Sale => "SALE",
            Action::Auth => "AUTH",
            Action::ForcedAuth => "FORCED_AUTH",
            Action::PostAuth => "POST_AUTH",
            Action::IncrementAuth => "INCREMENT_AUTH",
            Action::Refund => "REFUND",
            Action::Void => "VOID",
            Action::TipAdjust => "TIP_ADJUST",
            Action::Query => "QUERY",
            Action::BatchClose => "BATCH_CLOSE",
            Action::Abort => "ABORT",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
