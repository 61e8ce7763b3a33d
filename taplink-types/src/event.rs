//! Payment progress and terminal events.
//!
//! A transaction completion receives a stream of [`PaymentEvent`]s. Only
//! [`PaymentEvent::Completed`] terminates a transaction positively and only
//! [`PaymentEvent::Cancel`] terminates it negatively; every other variant is
//! progress-only.

use crate::envelope::{EventCode, ParseError};

/// TapLink event codes as they appear in the `eventCode` envelope field.
pub mod event_codes {
    /// Transaction accepted, processing started.
    pub const PROCESSING: u64 = 4000;
    /// Terminal is waiting for a card.
    pub const WAITING_CARD: u64 = 4001;
    /// A card entered the field.
    pub const CARD_DETECTED: u64 = 4002;
    /// Transaction completed successfully.
    pub const COMPLETED: u64 = 4003;
    /// Transaction cancelled.
    pub const CANCEL: u64 = 4004;
    /// Terminal is reading the card.
    pub const READING_CARD: u64 = 4005;
    /// Terminal is waiting for PIN entry.
    pub const WAITING_PIN: u64 = 4006;
    /// Terminal is waiting for a signature.
    pub const WAITING_SIGNATURE: u64 = 4007;
    /// Waiting for the online authorization response.
    pub const WAITING_ONLINE_RESPONSE: u64 = 4008;
    /// Terminal is printing.
    pub const PRINTING: u64 = 4009;
    /// The SDK is reconnecting to the terminal.
    pub const RECONNECTING: u64 = 4010;
}

/// A progress or terminal event observed during a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentEvent {
    /// Transaction accepted, processing started.
    Processing,
    /// Terminal is waiting for a card.
    WaitingCard,
    /// A card entered the field.
    CardDetected,
    /// Terminal is reading the card.
    ReadingCard,
    /// Terminal is waiting for PIN entry.
    WaitingPin,
    /// Terminal is waiting for a signature.
    WaitingSignature,
    /// Waiting for the online authorization response.
    WaitingOnlineResponse,
    /// Terminal is printing.
    Printing,
    /// The transaction completed successfully. Terminal, positive.
    Completed,
    /// The transaction was cancelled. Terminal, negative.
    Cancel,
    /// The SDK lost the terminal and is reconnecting.
    Reconnecting {
        /// Current attempt, 1-based.
        attempt: u32,
        /// Upper bound on reconnect attempts.
        max_retries: u32,
    },
}

impl PaymentEvent {
    /// Returns the numeric event code of this event.
    pub fn event_code(&self) -> u64 {
        match self {
            PaymentEvent::Processing => event_codes::PROCESSING,
            PaymentEvent::WaitingCard => event_codes::WAITING_CARD,
            PaymentEvent::CardDetected => event_codes::CARD_DETECTED,
            PaymentEvent::ReadingCard => event_codes::READING_CARD,
            PaymentEvent::WaitingPin => event_codes::WAITING_PIN,
            PaymentEvent::WaitingSignature => event_codes::WAITING_SIGNATURE,
            PaymentEvent::WaitingOnlineResponse => event_codes::WAITING_ONLINE_RESPONSE,
            PaymentEvent::Printing => event_codes::PRINTING,
            PaymentEvent::Completed => event_codes::COMPLETED,
            PaymentEvent::Cancel => event_codes::CANCEL,
            PaymentEvent::Reconnecting { .. } => event_codes::RECONNECTING,
        }
    }

    /// Returns the stable string code of this event.
    pub fn code(&self) -> &'static str {
        match self {
            PaymentEvent::Processing => "PROCESSING",
            PaymentEvent::WaitingCard => "WAITING_CARD",
            PaymentEvent::CardDetected => "CARD_DETECTED",
            PaymentEvent::ReadingCard => "READING_CARD",
            PaymentEvent::WaitingPin => "WAITING_PIN",
            PaymentEvent::WaitingSignature => "WAITING_SIGNATURE",
            PaymentEvent::WaitingOnlineResponse => "WAITING_ONLINE_RESPONSE",
            PaymentEvent::Printing => "PRINTING",
            PaymentEvent::Completed => "COMPLETED",
            PaymentEvent::Cancel => "CANCEL",
            PaymentEvent::Reconnecting { .. } => "RECONNECTING",
        }
    }

    /// Returns a human-readable message for this event.
    pub fn message(&self) -> String {
        match self {
            PaymentEvent::Processing => "processing transaction".to_string(),
            PaymentEvent::WaitingCard => "waiting for card".to_string(),
            PaymentEvent::CardDetected => "card detected".to_string(),
            PaymentEvent::ReadingCard => "reading card".to_string(),
            PaymentEvent::WaitingPin => "waiting for PIN entry".to_string(),
            PaymentEvent::WaitingSignature => "waiting for signature".to_string(),
            PaymentEvent::WaitingOnlineResponse => "waiting for online response".to_string(),
            PaymentEvent::Printing => "printing receipt".to_string(),
            PaymentEvent::Completed => "transaction completed".to_string(),
            PaymentEvent::Cancel => "transaction cancelled".to_string(),
            PaymentEvent::Reconnecting {
                attempt,
                max_retries,
            } => format!("reconnecting to terminal ({attempt}/{max_retries})"),
        }
    }

    /// Returns the progress percentage in `[0, 100]`.
    pub fn progress_percent(&self) -> u8 {
        match self {
            PaymentEvent::Processing => 10,
            PaymentEvent::WaitingCard => 20,
            PaymentEvent::CardDetected => 30,
            PaymentEvent::ReadingCard => 40,
            PaymentEvent::WaitingPin => 50,
            PaymentEvent::WaitingSignature => 60,
            PaymentEvent::WaitingOnlineResponse => 70,
            PaymentEvent::Printing => 90,
            PaymentEvent::Completed => 100,
            PaymentEvent::Cancel => 100,
            PaymentEvent::Reconnecting { .. } => 0,
        }
    }

    /// Returns `true` iff this event retires its transaction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentEvent::Completed | PaymentEvent::Cancel)
    }

    /// Maps an envelope event code to a payment event.
    ///
    /// Reconnecting counters are not carried in the code itself; events
    /// decoded from the wire report zeroed counters and the connection layer
    /// fills in real values for locally produced events.
    pub fn from_event_code(code: &EventCode) -> Result<Self, ParseError> {
        let event = match code.as_number() {
            Some(event_codes::PROCESSING) => PaymentEvent::Processing,
            Some(event_codes::WAITING_CARD) => PaymentEvent::WaitingCard,
            Some(event_codes::CARD_DETECTED) => PaymentEvent::CardDetected,
            Some(event_codes::READING_CARD) => PaymentEvent::ReadingCard,
            Some(event_codes::WAITING_PIN) => PaymentEvent::WaitingPin,
            Some(event_codes::WAITING_SIGNATURE) => PaymentEvent::WaitingSignature,
            Some(event_codes::WAITING_ONLINE_RESPONSE) => PaymentEvent::WaitingOnlineResponse,
            Some(event_codes::PRINTING) => PaymentEvent::Printing,
            Some(event_codes::COMPLETED) => PaymentEvent::Completed,
            Some(event_codes::CANCEL) => PaymentEvent::Cancel,
            Some(event_codes::RECONNECTING) => PaymentEvent::Reconnecting {
                attempt: 0,
                max_retries: 0,
            },
            _ => return Err(ParseError::UnknownEvent(code.to_string())),
        };
        Ok(event)
    }

    /// Like [`PaymentEvent::from_event_code`], but maps unknown codes to
    /// [`PaymentEvent::Processing`] instead of failing.
    pub fn from_event_code_lossy(code: &EventCode) -> Self {
        Self::from_event_code(code).unwrap_or(PaymentEvent::Processing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_4003_decodes_to_completed() {
        let code = EventCode::new("4003");
        assert_eq!(
            PaymentEvent::from_event_code(&code).unwrap(),
            PaymentEvent::Completed
        );
    }

    #[test]
    fn unknown_code_is_lossy_processing() {
        let code = EventCode::new("9999");
        assert!(PaymentEvent::from_event_code(&code).is_err());
        assert_eq!(
            PaymentEvent::from_event_code_lossy(&code),
            PaymentEvent::Processing
        );
    }

    #[test]
    fn only_completed_and_cancel_are_terminal() {
        assert!(PaymentEvent::Completed.is_terminal());
        assert!(PaymentEvent::Cancel.is_terminal());
        assert!(!PaymentEvent::Printing.is_terminal());
        assert!(
            !PaymentEvent::Reconnecting {
                attempt: 1,
                max_retries: 3
            }
            .is_terminal()
        );
    }

    #[test]
    fn progress_is_bounded() {
        let events = [
            PaymentEvent::Processing,
            PaymentEvent::WaitingCard,
            PaymentEvent::CardDetected,
            PaymentEvent::ReadingCard,
            PaymentEvent::WaitingPin,
            PaymentEvent::WaitingSignature,
            PaymentEvent::WaitingOnlineResponse,
            PaymentEvent::Printing,
            PaymentEvent::Completed,
            PaymentEvent::Cancel,
        ];
        for event in events {
            assert!(event.progress_percent() <= 100);
        }
    }
}
