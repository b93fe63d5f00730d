//! Terminal trait definitions.
//!
//! These traits establish the contract between the fleet and the physical
//! card terminals: a [`DeviceSubsystem`] enumerates terminals by stable name
//! and opens a [`TerminalChannel`] for each, and a terminal channel opens an
//! exclusive [`CardChannel`] session with the inserted card.
//!
//! All traits use native `async fn` methods (Rust 1.90 + Edition 2024 RPITIT),
//! eliminating the need for the `async_trait` macro.
//!
//! **NOTE**: These traits are NOT object-safe because `async fn` methods
//! return `impl Future`. Use the enum wrappers in [`crate::devices`] where a
//! single concrete type is needed.

#![allow(async_fn_in_trait)]

use std::time::Duration;

use crate::error::Result;

/// An exclusive session with the card inserted in one terminal.
///
/// The session ends when the value is dropped.
pub trait CardChannel: Send {
    /// Answer-to-reset bytes of the card.
    fn atr(&self) -> &[u8];

    /// Send one command APDU and return the full response, status word included.
    ///
    /// # Errors
    ///
    /// Returns a transport error carrying the platform code if the exchange
    /// fails (card removed, unresponsive card, terminal unplugged).
    async fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// One physical card terminal.
///
/// # Examples
///
/// ```
/// use cardgate_hardware::traits::TerminalChannel;
/// use cardgate_hardware::error::Result;
/// use std::time::Duration;
///
/// async fn card_inserted<T: TerminalChannel>(terminal: &T) -> Result<bool> {
///     terminal.wait_for_present(Duration::from_millis(250)).await
/// }
/// ```
pub trait TerminalChannel: Send + Sync {
    /// Session type opened by [`open_session`](Self::open_session).
    type Session: CardChannel;

    /// Stable name of the terminal.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for a card to be present.
    ///
    /// Returns `Ok(true)` as soon as a card is present and `Ok(false)` when
    /// the timeout elapses first.
    ///
    /// # Errors
    ///
    /// Returns [`TransportCode::ReaderUnavailable`](crate::TransportCode::ReaderUnavailable)
    /// if the terminal vanished.
    async fn wait_for_present(&self, timeout: Duration) -> Result<bool>;

    /// Wait up to `timeout` for the card to be removed.
    ///
    /// Returns `Ok(true)` as soon as no card is present and `Ok(false)` when
    /// the timeout elapses first.
    async fn wait_for_absent(&self, timeout: Duration) -> Result<bool>;

    /// Check whether a card is present right now.
    async fn is_present(&self) -> Result<bool>;

    /// Open an exclusive session with the inserted card.
    async fn open_session(&self) -> Result<Self::Session>;
}

/// The platform service that knows which terminals are attached.
pub trait DeviceSubsystem: Send + Sync {
    /// Channel type opened by [`open_terminal`](Self::open_terminal).
    type Terminal: TerminalChannel;

    /// Names of all attached terminals.
    ///
    /// # Errors
    ///
    /// Returns [`TransportCode::NoReadersAvailable`](crate::TransportCode::NoReadersAvailable)
    /// when nothing is attached and
    /// [`TransportCode::ServiceStopped`](crate::TransportCode::ServiceStopped) /
    /// [`TransportCode::NoService`](crate::TransportCode::NoService) when the
    /// service itself is gone.
    async fn list_terminals(&self) -> Result<Vec<String>>;

    /// Open a channel to the terminal with the given name.
    async fn open_terminal(&self, name: &str) -> Result<Self::Terminal>;

    /// Tear down and re-establish the device context.
    ///
    /// Called after the service was stopped or vanished, before the next
    /// enumeration attempt.
    async fn reinitialize(&self) -> Result<()>;
}
