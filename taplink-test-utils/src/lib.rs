//! Utilities for testing TapLink-based integrations.
//!
//! The centerpiece is [`EmulatedTerminal`]: an in-process Tapro terminal
//! speaking the JSON envelope protocol over a real WebSocket, with
//! scriptable behaviour per action. Tests dial it exactly like a terminal
//! on the shop floor.

mod terminal;

pub use terminal::{EmulatedTerminal, TerminalBehavior, TransactionScript};
