//! Terminal reader worker.
//!
//! One [`Terminal`] runs per physical card terminal. Its loop waits for a
//! card, reads it through the fleet's [`RecordDecoder`], queues the result
//! for the dispatcher and waits for the card to be removed:
//!
//! ```text
//! Initializing ─► WaitingForCard ─► ReadingCard ─► Success
//!                      ▲                        ├► UnresponsiveCard
//!                      │                        ├► ApduFault
//!                      │                        ├► ProtocolMismatch
//!                      │                        └► Failed
//!                      └──────── card removed ◄─────┘
//! ```
//!
//! A pause request parks the loop at the start of the next cycle (or while
//! waiting for a card), showing `Paused` and restoring the previous status
//! on resume. A read that already started always runs to completion.
//!
//! When the terminal itself disappears the worker drops its channel, shows
//! `WaitingForReader` and waits until the coordinator supplies a fresh
//! channel for the same name. Unknown transport faults end the worker with
//! an error.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cardgate_core::constants::MAX_TRANSITION_HISTORY;
use cardgate_core::{FleetConfig, Status};
use cardgate_hardware::{
    AnyTerminal, CardChannel, FaultClass, TerminalChannel, TransportCode, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cell::GatedCell;
use crate::decoder::{CardRecords, RecordDecoder};
use crate::error::{RecordFault, Result};
use crate::pause::PauseGate;
use crate::queue::PendingQueue;
use crate::signal::Signal;
use crate::snapshot::{CardToken, ProcessedReader};

/// Record of one status change of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    /// Status before the change.
    pub from: Status,

    /// Status after the change.
    pub to: Status,

    /// When the change happened.
    pub timestamp: Instant,
}

impl StatusTransition {
    fn new(from: Status, to: Status) -> Self {
        Self {
            from,
            to,
            timestamp: Instant::now(),
        }
    }

    /// Time since the change.
    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Collaborators shared by every terminal of a fleet.
#[derive(Clone)]
pub struct TerminalContext {
    /// Fleet timings.
    pub config: FleetConfig,

    /// Decoder used for every card.
    pub decoder: Arc<dyn RecordDecoder>,

    /// Queue of finished reads, drained by the dispatcher.
    pub queue: Arc<PendingQueue<ProcessedReader>>,

    /// Lock held while a result is published or processed.
    pub processing: Arc<tokio::sync::Mutex<()>>,
}

impl fmt::Debug for TerminalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalContext")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

enum Flow {
    Continue,
    Stop,
}

struct ReadOutcome {
    status: Status,
    records: Option<CardRecords>,
}

/// Worker for one card terminal.
pub struct Terminal {
    name: String,
    ctx: TerminalContext,
    status: GatedCell<Status>,
    card_present: Signal<bool>,
    current_card: Mutex<Option<CardToken>>,
    channel: watch::Sender<Option<Arc<AnyTerminal>>>,
    access: Arc<tokio::sync::Mutex<()>>,
    pause: PauseGate,
    history: Mutex<VecDeque<StatusTransition>>,
    insertions: AtomicU64,
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("name", &self.name)
            .field("status", &self.status.real())
            .field("locked", &self.status.is_locked())
            .field("paused", &self.pause.is_paused())
            .field("awaiting_device", &self.awaiting_device())
            .finish()
    }
}

impl Terminal {
    /// Create a worker for the terminal behind `channel`.
    pub fn new(channel: AnyTerminal, ctx: TerminalContext) -> Self {
        let name = channel.name().to_string();
        let (channel, _) = watch::channel(Some(Arc::new(channel)));

        Self {
            name,
            ctx,
            status: GatedCell::new(Status::Uninitialized, Status::Locked),
            card_present: Signal::new(false),
            current_card: Mutex::new(None),
            channel,
            access: Arc::new(tokio::sync::Mutex::new(())),
            pause: PauseGate::new(),
            history: Mutex::new(VecDeque::with_capacity(MAX_TRANSITION_HISTORY)),
            insertions: AtomicU64::new(0),
        }
    }

    /// Stable name of the terminal.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status cell of the terminal.
    pub fn status(&self) -> &GatedCell<Status> {
        &self.status
    }

    /// Whether a card sits in the terminal.
    pub fn card_present(&self) -> &Signal<bool> {
        &self.card_present
    }

    /// The card currently inserted, as far as the worker knows.
    pub fn current_card(&self) -> Option<CardToken> {
        self.current_card.lock().clone()
    }

    /// Status history, oldest first.
    pub fn history(&self) -> Vec<StatusTransition> {
        self.history.lock().iter().copied().collect()
    }

    /// The last `count` transitions, oldest first.
    pub fn last_transitions(&self, count: usize) -> Vec<StatusTransition> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(count);
        history.iter().skip(skip).copied().collect()
    }

    /// Request a pause. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        self.pause.pause()
    }

    /// Lift a pause request. Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        self.pause.resume()
    }

    /// Whether a pause request is active.
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Whether the worker lost its device and waits for a new channel.
    pub fn awaiting_device(&self) -> bool {
        self.channel.borrow().is_none()
    }

    /// Hand the worker a fresh channel to its device.
    pub fn supply_channel(&self, channel: AnyTerminal) {
        self.channel.send_replace(Some(Arc::new(channel)));
    }

    /// Current channel to the device, if any.
    pub fn channel(&self) -> Option<Arc<AnyTerminal>> {
        self.channel.borrow().clone()
    }

    pub(crate) fn access(&self) -> &Arc<tokio::sync::Mutex<()>> {
        &self.access
    }

    /// Run the worker until `cancel` fires or a fatal fault occurs.
    ///
    /// # Errors
    ///
    /// Returns the transport error of a fault that is not classified as
    /// recoverable.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(terminal = %self.name, "Terminal worker started");
        self.transition(Status::Initializing);

        loop {
            let Some(channel) = self.channel() else {
                if !self.wait_for_channel(&cancel).await {
                    break;
                }
                continue;
            };

            match self.cycle(&channel, &cancel).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(err) => match err.fault_class() {
                    FaultClass::RecoverableDevice
                    | FaultClass::NoDevices
                    | FaultClass::ServiceRestart => {
                        warn!(terminal = %self.name, error = %err, "Terminal lost");
                        self.release_channel(&channel);
                    }
                    FaultClass::RecoverableCard => {
                        warn!(terminal = %self.name, error = %err, "Card fault outside a read");
                        if !self.sleep(self.ctx.config.poll_interval(), &cancel).await {
                            break;
                        }
                    }
                    FaultClass::Interrupted => {
                        info!(terminal = %self.name, "Terminal wait interrupted");
                        break;
                    }
                    FaultClass::Fatal => {
                        error!(terminal = %self.name, error = %err, "Fatal terminal fault");
                        return Err(err.into());
                    }
                },
            }
        }

        info!(terminal = %self.name, "Terminal worker stopped");
        Ok(())
    }

    async fn cycle(
        self: &Arc<Self>,
        channel: &Arc<AnyTerminal>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Flow, TransportError> {
        let poll = self.ctx.config.poll_interval();

        if !self.pause_point(cancel).await {
            return Ok(Flow::Stop);
        }

        self.transition(Status::WaitingForCard);
        loop {
            if self.pause.is_paused() {
                return Ok(Flow::Continue);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Flow::Stop),
                present = channel.wait_for_present(poll) => {
                    if present? {
                        break;
                    }
                }
            }
        }

        let token = CardToken::new(self.insertions.fetch_add(1, Ordering::SeqCst) + 1);
        *self.current_card.lock() = Some(token.clone());
        self.card_present.set(true);
        if let Err(err) = self.status.unlock() {
            warn!(terminal = %self.name, error = %err, "Could not unlock terminal status");
        }
        self.transition(Status::ReadingCard);
        debug!(terminal = %self.name, card = %token, "Card inserted");

        let outcome = {
            let _access = tokio::select! {
                _ = cancel.cancelled() => return Ok(Flow::Stop),
                guard = self.access.lock() => guard,
            };
            match self.read_card(channel, &token, cancel).await? {
                Some(outcome) => outcome,
                None => return Ok(Flow::Stop),
            }
        };

        {
            let _processing = tokio::select! {
                _ = cancel.cancelled() => return Ok(Flow::Stop),
                guard = self.ctx.processing.lock() => guard,
            };
            self.transition(outcome.status);
            if outcome.records.is_none() {
                self.card_present.set(false);
            }
            let snapshot = ProcessedReader::capture(Arc::clone(self), outcome.records, outcome.status);
            self.ctx.queue.offer(snapshot);
            debug!(terminal = %self.name, status = %outcome.status, "Read result queued");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Flow::Stop),
                absent = channel.wait_for_absent(poll) => match absent {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) if err.fault_class() == FaultClass::RecoverableCard => break,
                    Err(err) => return Err(err),
                },
            }
        }

        self.clear_card();
        debug!(terminal = %self.name, card = %token, "Card removed");
        Ok(Flow::Continue)
    }

    /// Read the card, retrying APDU faults. `None` means cancelled.
    async fn read_card(
        &self,
        channel: &AnyTerminal,
        token: &CardToken,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<ReadOutcome>, TransportError> {
        let config = &self.ctx.config;
        if !self.sleep(config.settle_delay(), cancel).await {
            return Ok(None);
        }

        let mut retries_left = config.max_retries;
        let mut attempt = 1u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = self.read_once(channel, token) => result,
            };

            let fault = match result {
                Ok(records) => {
                    info!(terminal = %self.name, card = %token, fields = records.len(), "Card read");
                    return Ok(Some(ReadOutcome {
                        status: Status::Success,
                        records: Some(records),
                    }));
                }
                Err(fault) => fault,
            };

            if fault.is_retryable() && retries_left > 0 {
                warn!(terminal = %self.name, attempt, error = %fault, "Card read failed, retrying");
                retries_left -= 1;
                attempt += 1;
                if !self.sleep(config.retry_interval(), cancel).await {
                    return Ok(None);
                }
                continue;
            }

            warn!(terminal = %self.name, attempt, error = %fault, "Card read failed");
            let status = match fault {
                RecordFault::Apdu { .. } => Status::ApduFault,
                RecordFault::Malformed(_) => Status::Failed,
                RecordFault::Transport(err) if err.fault_class() == FaultClass::RecoverableCard => {
                    card_fault_status(err.code)
                }
                RecordFault::Transport(err) => return Err(err),
            };
            return Ok(Some(ReadOutcome {
                status,
                records: None,
            }));
        }
    }

    async fn read_once(
        &self,
        channel: &AnyTerminal,
        token: &CardToken,
    ) -> std::result::Result<CardRecords, RecordFault> {
        let mut session = channel.open_session().await?;
        {
            let mut current = self.current_card.lock();
            if current.as_ref().is_some_and(|card| card.id() == token.id()) {
                *current = Some(token.with_atr(session.atr()));
            }
        }
        self.ctx.decoder.decode(&mut session).await
    }

    /// Show `Paused` while a pause request is active. Returns `false` if cancelled.
    async fn pause_point(&self, cancel: &CancellationToken) -> bool {
        if !self.pause.is_paused() {
            return !cancel.is_cancelled();
        }

        // An outcome belongs to a card that may be gone by the time we resume
        let current = self.status.real();
        let resume_to = if current.is_waiting() {
            current
        } else {
            Status::WaitingForCard
        };
        self.transition(Status::Paused);
        info!(terminal = %self.name, "Terminal paused");

        if !self.pause.wait_resumed(cancel).await {
            return false;
        }

        info!(terminal = %self.name, "Terminal resumed");
        self.transition(resume_to);
        true
    }

    async fn wait_for_channel(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.channel.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => false,
            supplied = rx.wait_for(Option::is_some) => supplied.is_ok(),
        }
    }

    fn release_channel(&self, lost: &Arc<AnyTerminal>) {
        self.channel.send_if_modified(|current| {
            let same = current
                .as_ref()
                .is_some_and(|channel| Arc::ptr_eq(channel, lost));
            if same {
                *current = None;
            }
            same
        });
        self.clear_card();
        self.transition(Status::WaitingForReader);
    }

    fn clear_card(&self) {
        *self.current_card.lock() = None;
        self.card_present.set(false);
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if duration.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn transition(&self, to: Status) {
        let from = self.status.real();
        if from == to {
            return;
        }
        if !from.terminal_can_transition_to(to) {
            warn!(terminal = %self.name, %from, %to, "Unexpected status transition");
        }

        self.status.set(to);

        let mut history = self.history.lock();
        history.push_back(StatusTransition::new(from, to));
        if history.len() > MAX_TRANSITION_HISTORY {
            history.pop_front();
        }
        drop(history);

        debug!(terminal = %self.name, %from, %to, "Status changed");
    }
}

fn card_fault_status(code: TransportCode) -> Status {
    match code {
        TransportCode::UnresponsiveCard | TransportCode::UnpoweredCard => Status::UnresponsiveCard,
        TransportCode::ProtocolMismatch => Status::ProtocolMismatch,
        _ => Status::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ApduRecordDecoder;
    use cardgate_hardware::mock::{MockCard, MockTerminal, MockTerminalHandle};
    use rstest::rstest;

    const READ_NAME: [u8; 5] = [0x00, 0xB0, 0x00, 0x00, 0x02];

    struct Harness {
        terminal: Arc<Terminal>,
        handle: MockTerminalHandle,
        queue: Arc<PendingQueue<ProcessedReader>>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn config() -> FleetConfig {
        FleetConfig {
            poll_interval_ms: 10,
            settle_delay_ms: 0,
            retry_interval_ms: 5,
            max_retries: 2,
            ..FleetConfig::default()
        }
    }

    fn start() -> Harness {
        let (channel, handle) = MockTerminal::new("T1");
        let queue = Arc::new(PendingQueue::new());
        let ctx = TerminalContext {
            config: config(),
            decoder: Arc::new(ApduRecordDecoder::new().with_command("name", READ_NAME.to_vec())),
            queue: Arc::clone(&queue),
            processing: Arc::new(tokio::sync::Mutex::new(())),
        };
        let terminal = Arc::new(Terminal::new(AnyTerminal::Mock(channel), ctx));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&terminal).run(cancel.clone()));
        Harness {
            terminal,
            handle,
            queue,
            cancel,
            task,
        }
    }

    fn good_card() -> MockCard {
        MockCard::new(vec![0x3B, 0x01]).with_response(READ_NAME.to_vec(), vec![0x4A, 0x4F, 0x90, 0x00])
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_successful_read_cycle() {
        let h = start();
        eventually(|| h.terminal.status().real() == Status::WaitingForCard).await;

        h.handle.insert_card(good_card());
        eventually(|| h.queue.len() == 1).await;
        assert_eq!(h.terminal.status().real(), Status::Success);
        assert!(h.terminal.card_present().get());

        let snapshot = h.queue.try_take().unwrap();
        assert_eq!(snapshot.status(), Status::Success);
        assert_eq!(snapshot.records().unwrap().get("name"), Some("4A4F"));
        assert_eq!(snapshot.card().unwrap().atr(), &[0x3B, 0x01]);
        assert!(!snapshot.card_changed());

        h.handle.remove_card();
        eventually(|| h.terminal.status().real() == Status::WaitingForCard).await;
        assert!(snapshot.card_changed());
        assert!(!h.terminal.card_present().get());

        let path: Vec<Status> = h.terminal.history().iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                Status::Initializing,
                Status::WaitingForCard,
                Status::ReadingCard,
                Status::Success,
                Status::WaitingForCard,
            ]
        );
        assert_eq!(h.terminal.last_transitions(2).len(), 2);

        h.cancel.cancel();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_apdu_fault_after_retries() {
        let h = start();
        h.handle.insert_card(MockCard::new(vec![0x3B]));

        eventually(|| h.queue.len() == 1).await;
        assert_eq!(h.terminal.status().real(), Status::ApduFault);
        assert_eq!(h.handle.sessions_opened(), 3);
        assert!(!h.terminal.card_present().get());

        let snapshot = h.queue.try_take().unwrap();
        assert!(snapshot.records().is_none());
        h.cancel.cancel();
    }

    #[rstest]
    #[case(TransportCode::UnresponsiveCard, Status::UnresponsiveCard)]
    #[case(TransportCode::UnpoweredCard, Status::UnresponsiveCard)]
    #[case(TransportCode::ProtocolMismatch, Status::ProtocolMismatch)]
    #[case(TransportCode::ResetCard, Status::Failed)]
    #[tokio::test]
    async fn test_card_faults_are_not_retried(#[case] code: TransportCode, #[case] expected: Status) {
        let h = start();
        h.handle.insert_card(good_card().with_open_error(code));

        eventually(|| h.queue.len() == 1).await;
        assert_eq!(h.terminal.status().real(), expected);
        assert_eq!(h.handle.sessions_opened(), 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_waits_for_new_channel_after_detach() {
        let h = start();
        eventually(|| h.terminal.status().real() == Status::WaitingForCard).await;

        h.handle.detach();
        eventually(|| h.terminal.awaiting_device()).await;
        assert_eq!(h.terminal.status().real(), Status::WaitingForReader);

        h.handle.attach();
        h.terminal.supply_channel(AnyTerminal::Mock(h.handle.open().unwrap()));
        eventually(|| h.terminal.status().real() == Status::WaitingForCard).await;
        assert!(!h.terminal.awaiting_device());

        h.handle.insert_card(good_card());
        eventually(|| h.queue.len() == 1).await;
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_pause_holds_cycle() {
        let h = start();
        eventually(|| h.terminal.status().real() == Status::WaitingForCard).await;

        assert!(h.terminal.pause());
        eventually(|| h.terminal.status().real() == Status::Paused).await;

        h.handle.insert_card(good_card());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.queue.is_empty());

        assert!(h.terminal.resume());
        eventually(|| h.queue.len() == 1).await;
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_resume_after_removal_returns_to_waiting() {
        let h = start();
        eventually(|| h.terminal.status().real() == Status::WaitingForCard).await;
        h.handle.insert_card(good_card());
        eventually(|| h.queue.len() == 1).await;

        assert!(h.terminal.pause());
        h.handle.remove_card();
        eventually(|| h.terminal.status().real() == Status::Paused).await;
        assert!(h.terminal.resume());
        eventually(|| h.terminal.status().real() == Status::WaitingForCard).await;

        let path: Vec<Status> = h.terminal.history().iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                Status::Initializing,
                Status::WaitingForCard,
                Status::ReadingCard,
                Status::Success,
                Status::Paused,
                Status::WaitingForCard,
            ]
        );
        assert_eq!(path.iter().filter(|s| **s == Status::Success).count(), 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_fatal_fault_ends_worker() {
        let h = start();
        h.handle.insert_card(good_card().with_open_error(TransportCode::Unknown));

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(crate::FleetError::Transport(_))));
    }

    #[test]
    fn test_history_is_bounded() {
        let (channel, _handle) = MockTerminal::new("T1");
        let ctx = TerminalContext {
            config: config(),
            decoder: Arc::new(ApduRecordDecoder::new()),
            queue: Arc::new(PendingQueue::new()),
            processing: Arc::new(tokio::sync::Mutex::new(())),
        };
        let terminal = Terminal::new(AnyTerminal::Mock(channel), ctx);

        for _ in 0..MAX_TRANSITION_HISTORY {
            terminal.transition(Status::WaitingForCard);
            terminal.transition(Status::ReadingCard);
        }
        assert_eq!(terminal.history().len(), MAX_TRANSITION_HISTORY);
        assert_eq!(terminal.last_transitions(1)[0].to, Status::ReadingCard);
    }
}
