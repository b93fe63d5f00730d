//! Mock card terminal for testing and development.
//!
//! A [`MockTerminal`] behaves like a physical contact reader whose card slot
//! is driven programmatically through a [`MockTerminalHandle`]: cards are
//! inserted and removed, the terminal can be unplugged and plugged back in,
//! and every command sent to a card is recorded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Result, TransportCode, TransportError};
use crate::traits::{CardChannel, TerminalChannel};

/// Status word returned for commands a mock card does not know (file not found).
pub const SW_NOT_FOUND: [u8; 2] = [0x6A, 0x82];

/// Status word returned while a mock card is scripted to fail (no precise diagnosis).
pub const SW_NO_DIAGNOSIS: [u8; 2] = [0x6F, 0x00];

/// A simulated card.
///
/// # Examples
///
/// ```
/// use cardgate_hardware::mock::MockCard;
///
/// let card = MockCard::new(vec![0x3B, 0x8F, 0x80])
///     .with_response(vec![0x00, 0xB0, 0x00, 0x00, 0x00], vec![0x4A, 0x4F, 0x90, 0x00]);
/// assert_eq!(card.atr(), &[0x3B, 0x8F, 0x80]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCard {
    atr: Vec<u8>,
    responses: HashMap<Vec<u8>, Vec<u8>>,
    default_response: Vec<u8>,
    open_error: Option<TransportCode>,
    failing_sessions: usize,
    response_delay: Duration,
}

impl MockCard {
    /// Create a card with the given ATR that answers every command with `6A 82`.
    pub fn new(atr: Vec<u8>) -> Self {
        Self {
            atr,
            responses: HashMap::new(),
            default_response: SW_NOT_FOUND.to_vec(),
            open_error: None,
            failing_sessions: 0,
            response_delay: Duration::ZERO,
        }
    }

    /// Answer `command` with `response` (status word included).
    pub fn with_response(mut self, command: Vec<u8>, response: Vec<u8>) -> Self {
        self.responses.insert(command, response);
        self
    }

    /// Answer unknown commands with `response` instead of `6A 82`.
    pub fn with_default_response(mut self, response: Vec<u8>) -> Self {
        self.default_response = response;
        self
    }

    /// Make the first `sessions` sessions answer every command with `6F 00`.
    pub fn failing_first(mut self, sessions: usize) -> Self {
        self.failing_sessions = sessions;
        self
    }

    /// Fail every session open with `code`.
    pub fn with_open_error(mut self, code: TransportCode) -> Self {
        self.open_error = Some(code);
        self
    }

    /// Shorthand for a card that never answers to reset.
    pub fn unresponsive(self) -> Self {
        self.with_open_error(TransportCode::UnresponsiveCard)
    }

    /// Delay every response by `delay`.
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Get the card ATR.
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }
}

#[derive(Debug, Clone)]
struct SlotState {
    card: Option<MockCard>,
    attached: bool,
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    name: String,
    slot: watch::Sender<SlotState>,
    sessions_opened: AtomicUsize,
    card_sessions: AtomicUsize,
    transmitted: Mutex<Vec<Vec<u8>>>,
}

impl Shared {
    fn check_attached(&self, generation: u64) -> Result<()> {
        let slot = self.slot.borrow();
        if slot.attached && slot.generation == generation {
            Ok(())
        } else {
            Err(TransportError::reader_unavailable(self.name.clone()))
        }
    }
}

/// Mock card terminal.
///
/// # Examples
///
/// ```
/// use cardgate_hardware::mock::{MockCard, MockTerminal};
/// use cardgate_hardware::traits::TerminalChannel;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> cardgate_hardware::Result<()> {
///     let (terminal, handle) = MockTerminal::new("T1");
///
///     assert!(!terminal.wait_for_present(Duration::from_millis(10)).await?);
///
///     handle.insert_card(MockCard::new(vec![0x3B, 0x00]));
///     assert!(terminal.wait_for_present(Duration::from_millis(10)).await?);
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MockTerminal {
    shared: Arc<Shared>,
    generation: u64,
}

impl MockTerminal {
    /// Create an attached, empty terminal and its control handle.
    pub fn new(name: impl Into<String>) -> (Self, MockTerminalHandle) {
        let (slot, _) = watch::channel(SlotState {
            card: None,
            attached: true,
            generation: 0,
        });

        let shared = Arc::new(Shared {
            name: name.into(),
            slot,
            sessions_opened: AtomicUsize::new(0),
            card_sessions: AtomicUsize::new(0),
            transmitted: Mutex::new(Vec::new()),
        });

        let terminal = Self {
            shared: Arc::clone(&shared),
            generation: 0,
        };

        (terminal, MockTerminalHandle { shared })
    }

    async fn wait_for_slot(&self, timeout: Duration, want_card: bool) -> Result<bool> {
        let generation = self.generation;
        let mut rx = self.shared.slot.subscribe();

        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|slot| {
                !slot.attached || slot.generation != generation || slot.card.is_some() == want_card
            }),
        )
        .await;

        match waited {
            Err(_elapsed) => Ok(false),
            Ok(Err(_closed)) => Err(TransportError::reader_unavailable(self.shared.name.clone())),
            Ok(Ok(slot)) => {
                let attached = slot.attached && slot.generation == generation;
                drop(slot);
                if attached {
                    Ok(true)
                } else {
                    Err(TransportError::reader_unavailable(self.shared.name.clone()))
                }
            }
        }
    }
}

impl TerminalChannel for MockTerminal {
    type Session = MockSession;

    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn wait_for_present(&self, timeout: Duration) -> Result<bool> {
        self.wait_for_slot(timeout, true).await
    }

    async fn wait_for_absent(&self, timeout: Duration) -> Result<bool> {
        self.wait_for_slot(timeout, false).await
    }

    async fn is_present(&self) -> Result<bool> {
        self.shared.check_attached(self.generation)?;
        Ok(self.shared.slot.borrow().card.is_some())
    }

    async fn open_session(&self) -> Result<MockSession> {
        self.shared.check_attached(self.generation)?;

        let card = self
            .shared
            .slot
            .borrow()
            .card
            .clone()
            .ok_or_else(|| TransportError::new(TransportCode::NoSmartcard, self.shared.name.clone()))?;

        self.shared.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let attempt = self.shared.card_sessions.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(code) = card.open_error {
            return Err(TransportError::new(code, self.shared.name.clone()));
        }

        Ok(MockSession {
            shared: Arc::clone(&self.shared),
            generation: self.generation,
            failing: attempt <= card.failing_sessions,
            card,
        })
    }
}

/// Exclusive session with a mock card.
#[derive(Debug)]
pub struct MockSession {
    shared: Arc<Shared>,
    generation: u64,
    card: MockCard,
    failing: bool,
}

impl CardChannel for MockSession {
    fn atr(&self) -> &[u8] {
        &self.card.atr
    }

    async fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        if !self.card.response_delay.is_zero() {
            tokio::time::sleep(self.card.response_delay).await;
        }

        self.shared.check_attached(self.generation)?;
        if self.shared.slot.borrow().card.as_ref() != Some(&self.card) {
            return Err(TransportError::removed_card(self.shared.name.clone()));
        }

        self.shared.transmitted.lock().push(command.to_vec());

        if self.failing {
            return Ok(SW_NO_DIAGNOSIS.to_vec());
        }

        Ok(self
            .card
            .responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| self.card.default_response.clone()))
    }
}

/// Handle for controlling a mock terminal.
///
/// Cloning the handle yields another controller of the same terminal.
#[derive(Debug, Clone)]
pub struct MockTerminalHandle {
    shared: Arc<Shared>,
}

impl MockTerminalHandle {
    /// Get the terminal name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Insert a card, replacing any card already in the slot.
    pub fn insert_card(&self, card: MockCard) {
        self.shared.card_sessions.store(0, Ordering::SeqCst);
        self.shared.slot.send_modify(|slot| slot.card = Some(card));
    }

    /// Remove the card from the slot.
    pub fn remove_card(&self) {
        self.shared.slot.send_modify(|slot| slot.card = None);
    }

    /// Check whether a card is in the slot.
    pub fn is_card_inserted(&self) -> bool {
        self.shared.slot.borrow().card.is_some()
    }

    /// Unplug the terminal.
    ///
    /// Every channel opened so far fails with
    /// [`TransportCode::ReaderUnavailable`] from now on, even after the
    /// terminal is attached again.
    pub fn detach(&self) {
        self.shared.slot.send_modify(|slot| {
            slot.attached = false;
            slot.generation += 1;
        });
    }

    /// Plug the terminal back in.
    pub fn attach(&self) {
        self.shared.slot.send_modify(|slot| slot.attached = true);
    }

    /// Check whether the terminal is plugged in.
    pub fn is_attached(&self) -> bool {
        self.shared.slot.borrow().attached
    }

    /// Open a new channel to this terminal, as the subsystem would.
    ///
    /// # Errors
    ///
    /// Returns [`TransportCode::ReaderUnavailable`] while detached.
    pub fn open(&self) -> Result<MockTerminal> {
        let slot = self.shared.slot.borrow();
        if !slot.attached {
            return Err(TransportError::reader_unavailable(self.shared.name.clone()));
        }
        Ok(MockTerminal {
            shared: Arc::clone(&self.shared),
            generation: slot.generation,
        })
    }

    /// Number of sessions opened on this terminal since creation.
    pub fn sessions_opened(&self) -> usize {
        self.shared.sessions_opened.load(Ordering::SeqCst)
    }

    /// Every command transmitted to any card of this terminal, in order.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.shared.transmitted.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ_NAME: [u8; 5] = [0x00, 0xB0, 0x00, 0x00, 0x00];

    fn named_card() -> MockCard {
        MockCard::new(vec![0x3B, 0x8F]).with_response(READ_NAME.to_vec(), vec![0x4A, 0x4F, 0x90, 0x00])
    }

    #[tokio::test]
    async fn test_mock_terminal_present_and_absent() {
        let (terminal, handle) = MockTerminal::new("T1");

        assert!(!terminal.is_present().await.unwrap());
        assert!(terminal.wait_for_absent(Duration::from_millis(5)).await.unwrap());

        handle.insert_card(named_card());
        assert!(terminal.is_present().await.unwrap());
        assert!(!terminal.wait_for_absent(Duration::from_millis(5)).await.unwrap());

        handle.remove_card();
        assert!(terminal.wait_for_absent(Duration::from_millis(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_terminal_wakes_waiter_on_insert() {
        let (terminal, handle) = MockTerminal::new("T1");

        let waiter = tokio::spawn(async move {
            terminal.wait_for_present(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.insert_card(named_card());

        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_mock_session_transmit() {
        let (terminal, handle) = MockTerminal::new("T1");
        handle.insert_card(named_card());

        let mut session = terminal.open_session().await.unwrap();
        assert_eq!(session.atr(), &[0x3B, 0x8F]);

        let response = session.transmit(&READ_NAME).await.unwrap();
        assert_eq!(response, vec![0x4A, 0x4F, 0x90, 0x00]);

        let unknown = session.transmit(&[0x00, 0xA4, 0x04, 0x00]).await.unwrap();
        assert_eq!(unknown, SW_NOT_FOUND.to_vec());

        assert_eq!(handle.sessions_opened(), 1);
        assert_eq!(handle.transmitted().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_session_fails_after_removal() {
        let (terminal, handle) = MockTerminal::new("T1");
        handle.insert_card(named_card());

        let mut session = terminal.open_session().await.unwrap();
        handle.remove_card();

        let err = session.transmit(&READ_NAME).await.unwrap_err();
        assert_eq!(err.code, TransportCode::RemovedCard);
    }

    #[tokio::test]
    async fn test_mock_card_failing_first_sessions() {
        let (terminal, handle) = MockTerminal::new("T1");
        handle.insert_card(named_card().failing_first(1));

        let mut first = terminal.open_session().await.unwrap();
        assert_eq!(first.transmit(&READ_NAME).await.unwrap(), SW_NO_DIAGNOSIS.to_vec());
        drop(first);

        let mut second = terminal.open_session().await.unwrap();
        assert_eq!(
            second.transmit(&READ_NAME).await.unwrap(),
            vec![0x4A, 0x4F, 0x90, 0x00]
        );
    }

    #[tokio::test]
    async fn test_mock_unresponsive_card() {
        let (terminal, handle) = MockTerminal::new("T1");
        handle.insert_card(named_card().unresponsive());

        let err = terminal.open_session().await.unwrap_err();
        assert_eq!(err.code, TransportCode::UnresponsiveCard);
    }

    #[tokio::test]
    async fn test_detach_invalidates_old_channel() {
        let (terminal, handle) = MockTerminal::new("T1");

        handle.detach();
        let err = terminal
            .wait_for_present(Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_device_gone());
        assert!(handle.open().is_err());

        handle.attach();
        let err = terminal.is_present().await.unwrap_err();
        assert!(err.is_device_gone());

        let reopened = handle.open().unwrap();
        assert!(!reopened.is_present().await.unwrap());
    }

    #[tokio::test]
    async fn test_detach_wakes_waiter() {
        let (terminal, handle) = MockTerminal::new("T1");

        let waiter = tokio::spawn(async move {
            terminal.wait_for_present(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.detach();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code, TransportCode::ReaderUnavailable);
    }
}
