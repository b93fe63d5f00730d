//! Hand-off of read results to the application.
//!
//! The dispatcher calls a [`CardHandler`] for every result it processes.
//! A successful read comes with a [`Completion`]; the dispatcher does not
//! move on until it is completed, which gives the application all the time
//! it needs to show or act on the records.

use tokio::sync::oneshot;
use tracing::warn;

use crate::snapshot::ProcessedReader;

/// Receiver of processed read results.
///
/// Both methods are called on the dispatcher task and must not block; long
/// work belongs on another task, holding on to the [`Completion`].
pub trait CardHandler: Send + Sync {
    /// Records were read from a card.
    ///
    /// The dispatcher waits until `done` is completed or dropped.
    fn records_available(&self, reading: ProcessedReader, done: Completion);

    /// A card was inserted but no usable records came out of it.
    fn reading_failed(&self, reading: ProcessedReader);
}

/// One-shot completion signal for [`CardHandler::records_available`].
///
/// Dropping it without calling [`complete`](Self::complete) also releases the
/// dispatcher, but is logged as a warning.
#[derive(Debug)]
pub struct Completion {
    terminal: String,
    done: Option<oneshot::Sender<()>>,
}

impl Completion {
    pub(crate) fn new(terminal: impl Into<String>) -> (Self, oneshot::Receiver<()>) {
        let (done, completed) = oneshot::channel();
        let completion = Self {
            terminal: terminal.into(),
            done: Some(done),
        };
        (completion, completed)
    }

    /// Name of the terminal whose result is being handled.
    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    /// Signal that the application is done with the result.
    pub fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            warn!(terminal = %self.terminal, "Completion dropped without being completed");
            let _ = done.send(());
        }
    }
}
