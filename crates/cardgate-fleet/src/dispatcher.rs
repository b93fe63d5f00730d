//! Result dispatcher.
//!
//! Terminals finish reads concurrently, but only one result may be shown or
//! acted upon at a time. The [`Dispatcher`] drains the shared
//! [`PendingQueue`] one snapshot at a time. For each one it:
//!
//! - takes the processing lock and the terminal's access lock
//! - binds the fleet status lock and the fleet card-present flag to the
//!   terminal, so the fleet mirrors exactly that terminal
//! - calls the [`CardHandler`] and, for a successful read, waits for the
//!   handler's [`Completion`] while the terminal's status is frozen
//! - holds both locks until the card is removed from that terminal
//!
//! Snapshots whose card was swapped or removed in the meantime are dropped
//! without reaching the handler. While nothing is processed the fleet status
//! is recomputed from all terminals with [`aggregate`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cardgate_core::{FleetConfig, Status};
use cardgate_hardware::{FaultClass, TerminalChannel};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::aggregate;
use crate::cell::{GatedCell, ListenerId, Lockable};
use crate::decoder::RecordDecoder;
use crate::error::Result;
use crate::handler::{CardHandler, Completion};
use crate::pause::PauseGate;
use crate::queue::PendingQueue;
use crate::registry::TerminalRegistry;
use crate::signal::Signal;
use crate::snapshot::ProcessedReader;
use crate::terminal::{Terminal, TerminalContext};

/// Single-flight consumer of terminal read results.
pub struct Dispatcher {
    config: FleetConfig,
    status: GatedCell<Status>,
    card_present: Signal<bool>,
    queue: Arc<PendingQueue<ProcessedReader>>,
    processing_lock: Arc<Mutex<()>>,
    processing: AtomicBool,
    pause: PauseGate,
    handler: Arc<dyn CardHandler>,
    registry: Arc<TerminalRegistry>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("status", &self.status)
            .field("card_present", &self.card_present)
            .field("pending", &self.queue.keys())
            .field("processing", &self.processing.load(Ordering::SeqCst))
            .field("paused", &self.pause.is_paused())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        config: FleetConfig,
        handler: Arc<dyn CardHandler>,
        registry: Arc<TerminalRegistry>,
    ) -> Self {
        Self {
            config,
            status: GatedCell::new(Status::Uninitialized, Status::Locked),
            card_present: Signal::new(false),
            queue: Arc::new(PendingQueue::new()),
            processing_lock: Arc::new(Mutex::new(())),
            processing: AtomicBool::new(false),
            pause: PauseGate::new(),
            handler,
            registry,
        }
    }

    /// Context for terminals that report to this dispatcher.
    pub fn terminal_context(&self, decoder: Arc<dyn RecordDecoder>) -> TerminalContext {
        TerminalContext {
            config: self.config.clone(),
            decoder,
            queue: Arc::clone(&self.queue),
            processing: Arc::clone(&self.processing_lock),
        }
    }

    /// Fleet-wide status cell.
    pub fn status(&self) -> &GatedCell<Status> {
        &self.status
    }

    /// Fleet-wide card-present flag.
    pub fn card_present(&self) -> &Signal<bool> {
        &self.card_present
    }

    /// Queue a snapshot. Returns `true` if it replaced a stale one.
    pub fn offer(&self, snapshot: ProcessedReader) -> bool {
        self.queue.offer(snapshot)
    }

    /// Hold the dispatch loop before its next snapshot. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        self.pause.pause()
    }

    /// Let the dispatch loop continue. Returns `false` if it was not paused.
    pub fn resume(&self) -> bool {
        self.pause.resume()
    }

    /// Whether a pause request is active.
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Show a device subsystem condition on the fleet status.
    ///
    /// Skipped while a result is queued or being processed, and while paused
    /// so that `Paused` stays visible. Returns whether the status was written.
    pub fn show_condition(&self, status: Status) -> bool {
        if !self.is_idle() || self.pause.is_paused() {
            return false;
        }
        self.status.set(status);
        true
    }

    /// Whether the queue is empty and no snapshot is being processed.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.processing.load(Ordering::SeqCst)
    }

    /// Number of queued snapshots.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Refresh the fleet signals whenever `terminal` changes its status, its
    /// lock state or its card-present flag.
    pub fn observe(self: &Arc<Self>, terminal: &Terminal) {
        let dispatcher = Arc::downgrade(self);
        terminal.status().subscribe(move |_, _| refresh_weak(&dispatcher));

        let dispatcher = Arc::downgrade(self);
        terminal
            .status()
            .add_lock_listener(Arc::new(move |_: bool| refresh_weak(&dispatcher)));

        let dispatcher = Arc::downgrade(self);
        terminal
            .card_present()
            .subscribe(move |_, _| refresh_weak(&dispatcher));
    }

    /// Recompute the fleet signals from all terminals.
    ///
    /// Does nothing while a snapshot is queued or being processed.
    pub fn refresh(&self) {
        if !self.is_idle() {
            return;
        }
        if self.pause.is_paused() {
            self.status.set(Status::Paused);
            return;
        }

        let (phases, any_present) = self.registry.phases();
        if let Some(status) = aggregate(&phases) {
            self.status.set(status);
        }
        self.card_present.set(any_present);
    }

    /// Run the dispatch loop until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the transport error of a fatal fault seen while waiting for
    /// card removal.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Result dispatcher started");

        loop {
            if !self.pause_point(&cancel).await {
                break;
            }
            if self.queue.is_empty() {
                self.refresh();
            }

            let snapshot = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.pause.paused() => continue,
                snapshot = self.queue.take() => snapshot,
            };

            let _busy = Busy::new(&self.processing);
            if !self.pause_point(&cancel).await {
                break;
            }
            self.process(snapshot, &cancel).await?;
        }

        info!("Result dispatcher stopped");
        Ok(())
    }

    async fn process(&self, snapshot: ProcessedReader, cancel: &CancellationToken) -> Result<()> {
        let _processing = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            guard = Arc::clone(&self.processing_lock).lock_owned() => guard,
        };
        let terminal = Arc::clone(snapshot.terminal());
        if snapshot.card_changed() {
            debug!(terminal = %terminal.name(), "Discarding result of a removed card");
            return Ok(());
        }

        let _access = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            guard = Arc::clone(terminal.access()).lock_owned() => guard,
        };
        if snapshot.card_changed() {
            debug!(terminal = %terminal.name(), "Discarding result of a removed card");
            return Ok(());
        }

        let _binding = ActiveBinding::install(self, &snapshot);
        self.status.set(Status::ProcessingCard);
        info!(terminal = %terminal.name(), status = %snapshot.status(), "Processing card result");

        match snapshot.status() {
            Status::Success => {
                if !self.deliver(&snapshot, cancel).await {
                    return Ok(());
                }
            }
            status if status.is_failure() => self.status.set(status),
            status => warn!(terminal = %terminal.name(), %status, "Result with unexpected status"),
        }

        if snapshot.records().is_none() {
            self.handler.reading_failed(snapshot.clone());
        }

        self.wait_for_removal(&snapshot, cancel).await
    }

    /// Hand the records to the handler and wait for its completion.
    /// Returns `false` if cancelled.
    async fn deliver(&self, snapshot: &ProcessedReader, cancel: &CancellationToken) -> bool {
        let terminal = snapshot.terminal();
        let status = terminal.status();
        if let Err(err) = status.lock() {
            warn!(terminal = %terminal.name(), error = %err, "Could not freeze terminal status");
        }

        let (done, completed) = Completion::new(terminal.name());
        self.handler.records_available(snapshot.clone(), done);

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = completed => {}
        }
        debug!(terminal = %terminal.name(), "Card handler completed");
        self.status.set(Status::Success);

        if let Some(display) = self.config.success_display() {
            if let Err(err) = status.unlock_after(display) {
                warn!(terminal = %terminal.name(), error = %err, "Could not schedule unlock");
            }
        }
        true
    }

    async fn wait_for_removal(
        &self,
        snapshot: &ProcessedReader,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let terminal = snapshot.terminal();
        let poll = self.config.poll_interval();

        loop {
            if snapshot.card_changed() {
                break;
            }
            let Some(channel) = terminal.channel() else {
                break;
            };

            let absent = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                absent = channel.wait_for_absent(poll) => absent,
            };
            match absent {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) if err.fault_class() == FaultClass::Fatal => {
                    error!(terminal = %terminal.name(), error = %err, "Fatal fault while waiting for removal");
                    return Err(err.into());
                }
                Err(err) => {
                    debug!(terminal = %terminal.name(), error = %err, "Treating fault as card removal");
                    break;
                }
            }
        }

        debug!(terminal = %terminal.name(), "Processed card removed");
        Ok(())
    }

    /// Show `Paused` while paused. Returns `false` if cancelled.
    async fn pause_point(&self, cancel: &CancellationToken) -> bool {
        if !self.pause.is_paused() {
            return !cancel.is_cancelled();
        }

        let resume_to = self.status.real();
        self.status.set(Status::Paused);
        info!("Result dispatcher paused");

        if !self.pause.wait_resumed(cancel).await {
            return false;
        }

        info!("Result dispatcher resumed");
        self.status.set(resume_to);
        true
    }
}

fn refresh_weak(dispatcher: &Weak<Dispatcher>) {
    if let Some(dispatcher) = dispatcher.upgrade() {
        dispatcher.refresh();
    }
}

/// Marks the dispatcher busy from dequeue until processing ends.
struct Busy<'a>(&'a AtomicBool);

impl<'a> Busy<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fleet signals bound to one terminal for the processing of its snapshot.
///
/// The status binding is released by a one-shot lock listener once the
/// terminal unlocks for the same card. Dropping the binding removes that
/// listener and forces the fleet card-present flag to `false`.
struct ActiveBinding<'a> {
    dispatcher: &'a Dispatcher,
    terminal: Arc<Terminal>,
    listener: ListenerId,
}

impl<'a> ActiveBinding<'a> {
    fn install(dispatcher: &'a Dispatcher, snapshot: &ProcessedReader) -> Self {
        let terminal = Arc::clone(snapshot.terminal());

        // A binding can outlive its processing when the terminal never unlocked
        if dispatcher.status.unbind_locking() {
            debug!("Released previous fleet status binding");
        }
        if let Err(err) = dispatcher.status.bind_locking(terminal.status().clone()) {
            warn!(terminal = %terminal.name(), error = %err, "Could not bind fleet status");
        }
        dispatcher.card_present.bind(terminal.card_present());

        let fleet_status = dispatcher.status.clone();
        let fleet_present = dispatcher.card_present.clone();
        let watched: Weak<Terminal> = Arc::downgrade(&terminal);
        let card = snapshot.card().cloned();
        let released = AtomicBool::new(false);

        let listener = terminal.status().add_lock_listener(Arc::new(move |locked: bool| {
            if locked {
                return;
            }
            let same_card = watched
                .upgrade()
                .is_some_and(|terminal| terminal.current_card() == card);
            if !same_card || released.swap(true, Ordering::SeqCst) {
                return;
            }
            fleet_status.unbind_locking();
            fleet_present.unbind();
            debug!("Fleet signals released by terminal unlock");
        }));

        Self {
            dispatcher,
            terminal,
            listener,
        }
    }
}

impl Drop for ActiveBinding<'_> {
    fn drop(&mut self) {
        self.terminal.status().remove_lock_listener(self.listener);
        self.dispatcher.card_present.unbind();
        self.dispatcher.card_present.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ApduRecordDecoder;
    use cardgate_hardware::AnyTerminal;
    use cardgate_hardware::mock::{MockCard, MockTerminal, MockTerminalHandle};
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    const READ_NAME: [u8; 5] = [0x00, 0xB0, 0x00, 0x00, 0x02];

    #[derive(Default)]
    struct Recorder {
        events: SyncMutex<Vec<(String, Status)>>,
    }

    impl CardHandler for Recorder {
        fn records_available(&self, reading: ProcessedReader, done: Completion) {
            self.events
                .lock()
                .push((reading.terminal().name().to_string(), reading.status()));
            done.complete();
        }

        fn reading_failed(&self, reading: ProcessedReader) {
            self.events
                .lock()
                .push((reading.terminal().name().to_string(), reading.status()));
        }
    }

    fn config() -> FleetConfig {
        FleetConfig {
            poll_interval_ms: 10,
            settle_delay_ms: 0,
            retry_interval_ms: 5,
            max_retries: 0,
            success_display_ms: 30,
            ..FleetConfig::default()
        }
    }

    fn setup() -> (Arc<Dispatcher>, Arc<Recorder>, Arc<TerminalRegistry>) {
        let recorder = Arc::new(Recorder::default());
        let registry = Arc::new(TerminalRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config(),
            recorder.clone(),
            Arc::clone(&registry),
        ));
        (dispatcher, recorder, registry)
    }

    fn add_terminal(
        dispatcher: &Arc<Dispatcher>,
        registry: &TerminalRegistry,
        name: &str,
        cancel: &CancellationToken,
    ) -> (Arc<Terminal>, MockTerminalHandle) {
        let (channel, handle) = MockTerminal::new(name);
        let decoder = Arc::new(ApduRecordDecoder::new().with_command("name", READ_NAME.to_vec()));
        let terminal = Arc::new(Terminal::new(
            AnyTerminal::Mock(channel),
            dispatcher.terminal_context(decoder),
        ));
        dispatcher.observe(&terminal);
        registry.insert(Arc::clone(&terminal));
        tokio::spawn(Arc::clone(&terminal).run(cancel.clone()));
        (terminal, handle)
    }

    fn good_card() -> MockCard {
        MockCard::new(vec![0x3B]).with_response(READ_NAME.to_vec(), vec![0x4A, 0x90, 0x00])
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
    async fn test_stale_snapshot_never_reaches_handler() {
        let (dispatcher, recorder, registry) = setup();
        let cancel = CancellationToken::new();
        let (terminal, handle) = add_terminal(&dispatcher, &registry, "T1", &cancel);

        handle.insert_card(good_card());
        eventually(|| dispatcher.pending() == 1).await;
        handle.remove_card();
        eventually(|| terminal.current_card().is_none()).await;

        tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));
        eventually(|| dispatcher.is_idle()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(recorder.events.lock().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failure_calls_failed_handler_and_binds_fleet() {
        let (dispatcher, recorder, registry) = setup();
        let cancel = CancellationToken::new();
        let (terminal, handle) = add_terminal(&dispatcher, &registry, "T1", &cancel);
        tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));

        handle.insert_card(MockCard::new(vec![0x3B]));
        eventually(|| recorder.events.lock().len() == 1).await;
        assert_eq!(
            recorder.events.lock()[0],
            ("T1".to_string(), Status::ApduFault)
        );
        assert_eq!(dispatcher.status().get(), Status::ApduFault);
        assert!(dispatcher.status().is_bound());
        assert!(!dispatcher.is_idle());

        handle.remove_card();
        eventually(|| dispatcher.is_idle()).await;
        eventually(|| dispatcher.status().get() == Status::WaitingForCard).await;
        assert_eq!(terminal.status().real(), Status::WaitingForCard);
        assert_eq!(recorder.events.lock().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_success_freezes_until_display_elapses() {
        let (dispatcher, recorder, registry) = setup();
        let cancel = CancellationToken::new();
        let (terminal, handle) = add_terminal(&dispatcher, &registry, "T1", &cancel);
        tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));

        handle.insert_card(good_card());
        eventually(|| recorder.events.lock().len() == 1).await;
        assert!(terminal.status().is_locked());
        assert!(dispatcher.card_present().get());

        eventually(|| !dispatcher.status().is_bound()).await;
        assert!(!terminal.status().is_locked());
        assert_eq!(dispatcher.status().get(), Status::Success);

        handle.remove_card();
        eventually(|| dispatcher.status().get() == Status::WaitingForCard).await;
        assert!(!dispatcher.card_present().get());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_pause_shows_paused_when_idle() {
        let (dispatcher, _recorder, registry) = setup();
        let cancel = CancellationToken::new();
        add_terminal(&dispatcher, &registry, "T1", &cancel);
        tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));
        eventually(|| dispatcher.status().get() == Status::WaitingForCard).await;

        dispatcher.pause();
        eventually(|| dispatcher.status().get() == Status::Paused).await;

        dispatcher.resume();
        eventually(|| dispatcher.status().get() == Status::WaitingForCard).await;
        cancel.cancel();
    }
}
