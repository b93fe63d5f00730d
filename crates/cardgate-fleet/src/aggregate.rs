//! Fleet status aggregation.
//!
//! While the dispatcher is idle the fleet status summarizes the terminals.
//! The rules are ordered; the first one that applies wins:
//!
//! 1. a terminal is reading a card: `ReadingCard`
//! 2. a terminal status is locked: keep the fleet status
//! 3. a terminal shows `Success`: keep the fleet status
//! 4. a terminal waits for a card: `WaitingForCard`
//! 5. otherwise keep the fleet status

use cardgate_core::Status;

/// What aggregation needs to know about one terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalPhase {
    /// Real status of the terminal.
    pub status: Status,

    /// Whether the status cell is locked.
    pub locked: bool,
}

impl TerminalPhase {
    pub fn new(status: Status, locked: bool) -> Self {
        Self { status, locked }
    }
}

/// Status the fleet should show, or `None` to leave it unchanged.
///
/// # Examples
///
/// ```
/// use cardgate_core::Status;
/// use cardgate_fleet::{aggregate, TerminalPhase};
///
/// let phases = [
///     TerminalPhase::new(Status::WaitingForReader, false),
///     TerminalPhase::new(Status::WaitingForCard, false),
/// ];
/// assert_eq!(aggregate(&phases), Some(Status::WaitingForCard));
/// ```
pub fn aggregate(phases: &[TerminalPhase]) -> Option<Status> {
    if phases.iter().any(|p| p.status == Status::ReadingCard) {
        return Some(Status::ReadingCard);
    }
    if phases.iter().any(|p| p.locked || p.status == Status::Success) {
        return None;
    }
    if phases.iter().any(|p| p.status == Status::WaitingForCard) {
        return Some(Status::WaitingForCard);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn phase(status: Status) -> TerminalPhase {
        TerminalPhase::new(status, false)
    }

    #[rstest]
    #[case(vec![], None)]
    #[case(vec![phase(Status::WaitingForCard)], Some(Status::WaitingForCard))]
    #[case(vec![phase(Status::WaitingForCard), phase(Status::ReadingCard)], Some(Status::ReadingCard))]
    #[case(vec![phase(Status::Success), phase(Status::WaitingForCard)], None)]
    #[case(vec![phase(Status::Success), phase(Status::ReadingCard)], Some(Status::ReadingCard))]
    #[case(vec![TerminalPhase::new(Status::WaitingForCard, true), phase(Status::WaitingForCard)], None)]
    #[case(vec![phase(Status::ApduFault), phase(Status::WaitingForCard)], Some(Status::WaitingForCard))]
    #[case(vec![phase(Status::WaitingForReader), phase(Status::Paused)], None)]
    fn test_aggregate(#[case] phases: Vec<TerminalPhase>, #[case] expected: Option<Status>) {
        assert_eq!(aggregate(&phases), expected);
    }

    #[test]
    fn test_locked_reading_terminal_still_reports_reading() {
        let phases = [TerminalPhase::new(Status::ReadingCard, true)];
        assert_eq!(aggregate(&phases), Some(Status::ReadingCard));
    }
}
