//! Error types of the fleet.
//!
//! Recoverable faults never leave the component that detects them; they are
//! turned into a [`Status`](cardgate_core::Status) transition. What remains
//! here is either a usage error of a status cell, a decoding fault handed
//! back by a [`RecordDecoder`](crate::RecordDecoder), or a fatal fault that
//! ends the fleet.

use cardgate_hardware::TransportError;
use thiserror::Error;

/// Misuse of a [`GatedCell`](crate::GatedCell).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellError {
    #[error("Cell lock is owned by its delegate")]
    LockedThroughDelegate,

    #[error("Cell is already bound to a delegate")]
    AlreadyBound,

    #[error("Cell is locked directly and cannot be bound")]
    LockedDirectly,

    #[error("Delayed unlock needs a running Tokio runtime")]
    NoTimer,
}

/// Failure to decode the records of a card.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordFault {
    /// The card answered with a status word other than `90 00`.
    #[error("Card rejected command with status {sw1:02X} {sw2:02X}")]
    Apdu { sw1: u8, sw2: u8 },

    /// The exchange with the card failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The card answered, but not in a shape the decoder understands.
    #[error("Malformed card record: {0}")]
    Malformed(String),
}

impl RecordFault {
    /// Whether a new attempt on the same card may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Apdu { .. })
    }
}

/// Fatal fleet error.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Status cell error: {0}")]
    Cell(#[from] CellError),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Configuration error: {0}")]
    Config(#[from] cardgate_core::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use cardgate_hardware::TransportCode;

    #[test]
    fn test_record_fault_display() {
        let fault = RecordFault::Apdu { sw1: 0x6A, sw2: 0x82 };
        assert_eq!(fault.to_string(), "Card rejected command with status 6A 82");
        assert!(fault.is_retryable());

        let fault = RecordFault::from(TransportError::removed_card("T1"));
        assert!(!fault.is_retryable());
        assert_eq!(fault.to_string(), "card removed: T1");
    }

    #[test]
    fn test_fleet_error_from_transport() {
        let err: FleetError = TransportError::new(TransportCode::Unknown, "boom").into();
        assert!(matches!(err, FleetError::Transport(_)));
        assert_eq!(err.to_string(), "Transport error: unknown error: boom");
    }
}
