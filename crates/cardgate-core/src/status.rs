//! Terminal and fleet status.
//!
//! A single closed enumeration is shared by every terminal and by the
//! fleet-wide aggregate. Each terminal walks through the states below; the
//! fleet shows either one terminal's state (while a result is being handled)
//! or an aggregate of all of them.
//!
//! # Terminal transitions
//!
//! - Initializing → WaitingForCard → ReadingCard → outcome
//! - outcome → WaitingForCard (after the card is removed)
//! - any waiting state → WaitingForReader (device vanished) → WaitingForCard
//! - any waiting state or outcome → Paused → waiting state
//!
//! where *outcome* is one of `Success`, `UnresponsiveCard`, `ApduFault`,
//! `ProtocolMismatch` or `Failed`.
//!
//! # Examples
//!
//! ```
//! use cardgate_core::Status;
//!
//! assert!(Status::WaitingForCard.terminal_can_transition_to(Status::ReadingCard));
//! assert!(!Status::WaitingForCard.terminal_can_transition_to(Status::Success));
//! assert!(Status::ApduFault.is_failure());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a terminal, or of the fleet as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Nothing has been started yet.
    Uninitialized,

    /// The device subsystem or a terminal is being set up.
    Initializing,

    /// The platform card-reader driver is not available.
    DriverMissing,

    /// A pause request is active.
    Paused,

    /// Frozen substitute shown while a status cell is locked.
    ///
    /// Never a real state of a terminal.
    Locked,

    /// No terminal is attached, or this terminal's device vanished.
    WaitingForReader,

    /// The terminal is idle and waiting for a card.
    WaitingForCard,

    /// A card is inserted and its records are being read.
    ReadingCard,

    /// A read result is being handed to the application.
    ProcessingCard,

    /// The card did not answer.
    UnresponsiveCard,

    /// The card rejected a command even after retrying.
    ApduFault,

    /// The card and the terminal could not agree on a protocol.
    ProtocolMismatch,

    /// The read failed for any other card-level reason.
    Failed,

    /// The card was read successfully.
    Success,
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: [Status; 14] = [
        Status::Uninitialized,
        Status::Initializing,
        Status::DriverMissing,
        Status::Paused,
        Status::Locked,
        Status::WaitingForReader,
        Status::WaitingForCard,
        Status::ReadingCard,
        Status::ProcessingCard,
        Status::UnresponsiveCard,
        Status::ApduFault,
        Status::ProtocolMismatch,
        Status::Failed,
        Status::Success,
    ];

    /// Whether this status ends a read cycle.
    pub fn is_outcome(&self) -> bool {
        self.is_failure() || *self == Status::Success
    }

    /// Whether this status ends a read cycle without usable records.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Status::UnresponsiveCard | Status::ApduFault | Status::ProtocolMismatch | Status::Failed
        )
    }

    /// Whether a terminal in this status is parked at a suspension point.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Status::Initializing | Status::WaitingForCard | Status::WaitingForReader
        )
    }

    /// Check a terminal transition against the terminal transition table.
    ///
    /// Staying in the same status is always allowed. `Locked` is never a
    /// valid target because it is only ever a frozen substitute.
    pub fn terminal_can_transition_to(&self, target: Status) -> bool {
        if *self == target {
            return true;
        }

        match (self, target) {
            (_, Status::Locked) => false,
            (Status::Uninitialized, Status::Initializing) => true,
            (Status::Initializing, Status::WaitingForCard | Status::WaitingForReader) => true,
            (
                Status::WaitingForCard,
                Status::ReadingCard | Status::WaitingForReader,
            ) => true,
            (Status::ReadingCard, next) => next.is_outcome() || next == Status::WaitingForReader,
            (from, Status::WaitingForCard | Status::WaitingForReader) if from.is_outcome() => true,
            (Status::WaitingForReader, Status::WaitingForCard) => true,
            // Resuming only ever returns to a waiting status
            (from, Status::Paused) => from.is_waiting() || from.is_outcome(),
            (Status::Paused, next) => next.is_waiting(),
            _ => false,
        }
    }

    /// Short user-facing message for this status.
    pub fn message(&self) -> &'static str {
        match self {
            Status::Uninitialized => "Not started",
            Status::Initializing => "Starting card readers",
            Status::DriverMissing => "Card reader driver is not installed",
            Status::Paused => "Paused",
            Status::Locked => "Please wait",
            Status::WaitingForReader => "Connect a card reader",
            Status::WaitingForCard => "Insert a card",
            Status::ReadingCard => "Reading card, do not remove it",
            Status::ProcessingCard => "Processing card",
            Status::UnresponsiveCard => "Card is not responding, reinsert it",
            Status::ApduFault => "Card could not be read, reinsert it",
            Status::ProtocolMismatch => "Card is not supported by this reader",
            Status::Failed => "Card read failed",
            Status::Success => "Card read",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Uninitialized => "Uninitialized",
            Status::Initializing => "Initializing",
            Status::DriverMissing => "DriverMissing",
            Status::Paused => "Paused",
            Status::Locked => "Locked",
            Status::WaitingForReader => "WaitingForReader",
            Status::WaitingForCard => "WaitingForCard",
            Status::ReadingCard => "ReadingCard",
            Status::ProcessingCard => "ProcessingCard",
            Status::UnresponsiveCard => "UnresponsiveCard",
            Status::ApduFault => "ApduFault",
            Status::ProtocolMismatch => "ProtocolMismatch",
            Status::Failed => "Failed",
            Status::Success => "Success",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Status::Initializing, Status::WaitingForCard)]
    #[case(Status::WaitingForCard, Status::ReadingCard)]
    #[case(Status::ReadingCard, Status::Success)]
    #[case(Status::ReadingCard, Status::ApduFault)]
    #[case(Status::ReadingCard, Status::WaitingForReader)]
    #[case(Status::Success, Status::WaitingForCard)]
    #[case(Status::Failed, Status::WaitingForCard)]
    #[case(Status::WaitingForReader, Status::WaitingForCard)]
    #[case(Status::WaitingForCard, Status::Paused)]
    #[case(Status::Paused, Status::WaitingForCard)]
    #[case(Status::Success, Status::Paused)]
    fn test_valid_terminal_transitions(#[case] from: Status, #[case] to: Status) {
        assert!(from.terminal_can_transition_to(to), "{from} -> {to}");
    }

    #[rstest]
    #[case(Status::WaitingForCard, Status::Success)]
    #[case(Status::Initializing, Status::ReadingCard)]
    #[case(Status::Success, Status::ReadingCard)]
    #[case(Status::ReadingCard, Status::Paused)]
    #[case(Status::WaitingForCard, Status::Locked)]
    #[case(Status::Paused, Status::ReadingCard)]
    #[case(Status::Paused, Status::Success)]
    #[case(Status::Paused, Status::ApduFault)]
    fn test_invalid_terminal_transitions(#[case] from: Status, #[case] to: Status) {
        assert!(!from.terminal_can_transition_to(to), "{from} -> {to}");
    }

    #[test]
    fn test_self_transition_allowed() {
        for status in Status::ALL.into_iter().filter(|s| *s != Status::Locked) {
            assert!(status.terminal_can_transition_to(status));
        }
    }

    #[test]
    fn test_outcome_classification() {
        let outcomes: Vec<Status> = Status::ALL.into_iter().filter(Status::is_outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                Status::UnresponsiveCard,
                Status::ApduFault,
                Status::ProtocolMismatch,
                Status::Failed,
                Status::Success,
            ]
        );
        assert!(!Status::Success.is_failure());
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(Status::WaitingForReader.to_string(), "WaitingForReader");
        let json = serde_json::to_string(&Status::ProcessingCard).unwrap();
        assert_eq!(json, "\"processing_card\"");
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Status::ProcessingCard);
    }
}
