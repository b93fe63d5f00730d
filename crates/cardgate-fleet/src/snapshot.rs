//! Card read snapshots.

use std::fmt;
use std::sync::Arc;

use cardgate_core::Status;

use crate::decoder::CardRecords;
use crate::queue::Keyed;
use crate::terminal::Terminal;

/// Identity of one card insertion.
///
/// The id is assigned when the card is detected and the ATR is added once a
/// session was opened, so a token stays equal to itself for the whole time
/// the card sits in the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CardToken {
    id: u64,
    atr: Vec<u8>,
}

impl CardToken {
    pub(crate) fn new(id: u64) -> Self {
        Self { id, atr: Vec::new() }
    }

    pub(crate) fn with_atr(&self, atr: &[u8]) -> Self {
        Self {
            id: self.id,
            atr: atr.to_vec(),
        }
    }

    /// Insertion number, unique per terminal.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Answer-to-reset of the card; empty if no session could be opened.
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }
}

impl fmt::Display for CardToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.atr.is_empty() {
            write!(f, "#{}", self.id)
        } else {
            write!(f, "#{} ({})", self.id, hex::encode_upper(&self.atr))
        }
    }
}

/// Immutable capture of one finished read cycle ("processed reader").
#[derive(Clone)]
pub struct ProcessedReader {
    terminal: Arc<Terminal>,
    card: Option<CardToken>,
    records: Option<Arc<CardRecords>>,
    status: Status,
}

impl fmt::Debug for ProcessedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedReader")
            .field("terminal", &self.terminal.name())
            .field("card", &self.card)
            .field("records", &self.records.is_some())
            .field("status", &self.status)
            .finish()
    }
}

impl ProcessedReader {
    /// Capture the current card of `terminal` together with the read outcome.
    pub(crate) fn capture(
        terminal: Arc<Terminal>,
        records: Option<CardRecords>,
        status: Status,
    ) -> Self {
        let card = terminal.current_card();
        Self {
            terminal,
            card,
            records: records.map(Arc::new),
            status,
        }
    }

    /// The terminal that produced the result.
    pub fn terminal(&self) -> &Arc<Terminal> {
        &self.terminal
    }

    /// The card that was read.
    pub fn card(&self) -> Option<&CardToken> {
        self.card.as_ref()
    }

    /// Decoded records; `None` if the read failed.
    pub fn records(&self) -> Option<&CardRecords> {
        self.records.as_deref()
    }

    /// Terminal status when the snapshot was taken.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Whether the card was swapped or removed since the snapshot was taken.
    pub fn card_changed(&self) -> bool {
        self.terminal.current_card() != self.card
    }
}

impl Keyed for ProcessedReader {
    fn key(&self) -> &str {
        self.terminal.name()
    }
}
