//! Enum wrappers for terminal dispatch.
//!
//! Native `async fn` in traits (RPITIT - Rust Edition 2024) are not
//! object-safe, so the fleet cannot hold a `Box<dyn TerminalChannel>`.
//! These enums provide concrete type dispatch instead: the fleet is written
//! against [`AnySubsystem`] and [`AnyTerminal`], and each backend is one
//! variant, gated by its feature flag.
//!
//! # Examples
//!
//! ```
//! use cardgate_hardware::devices::AnySubsystem;
//! use cardgate_hardware::mock::MockSubsystem;
//!
//! let mock = MockSubsystem::new();
//! let subsystem = AnySubsystem::Mock(mock.clone());
//! let _t1 = mock.add_terminal("T1");
//! # let _ = subsystem;
//! ```

use std::time::Duration;

use crate::Result;
use crate::mock::{MockSession, MockSubsystem, MockTerminal};
#[cfg(feature = "hardware-pcsc")]
use crate::pcsc::{PcscSession, PcscSubsystem, PcscTerminal};
use crate::traits::{CardChannel, DeviceSubsystem, TerminalChannel};

/// Enum wrapper for card session dispatch.
#[derive(Debug)]
pub enum AnySession {
    /// Session with a mock card.
    Mock(MockSession),

    /// Session with a card in a PC/SC terminal.
    #[cfg(feature = "hardware-pcsc")]
    Pcsc(PcscSession),
}

impl CardChannel for AnySession {
    fn atr(&self) -> &[u8] {
        match self {
            Self::Mock(session) => session.atr(),
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(session) => session.atr(),
        }
    }

    async fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Mock(session) => session.transmit(command).await,
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(session) => session.transmit(command).await,
        }
    }
}

/// Enum wrapper for terminal dispatch.
#[derive(Debug)]
pub enum AnyTerminal {
    /// Mock terminal.
    Mock(MockTerminal),

    /// PC/SC terminal.
    #[cfg(feature = "hardware-pcsc")]
    Pcsc(PcscTerminal),
}

impl TerminalChannel for AnyTerminal {
    type Session = AnySession;

    fn name(&self) -> &str {
        match self {
            Self::Mock(terminal) => terminal.name(),
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(terminal) => terminal.name(),
        }
    }

    async fn wait_for_present(&self, timeout: Duration) -> Result<bool> {
        match self {
            Self::Mock(terminal) => terminal.wait_for_present(timeout).await,
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(terminal) => terminal.wait_for_present(timeout).await,
        }
    }

    async fn wait_for_absent(&self, timeout: Duration) -> Result<bool> {
        match self {
            Self::Mock(terminal) => terminal.wait_for_absent(timeout).await,
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(terminal) => terminal.wait_for_absent(timeout).await,
        }
    }

    async fn is_present(&self) -> Result<bool> {
        match self {
            Self::Mock(terminal) => terminal.is_present().await,
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(terminal) => terminal.is_present().await,
        }
    }

    async fn open_session(&self) -> Result<AnySession> {
        match self {
            Self::Mock(terminal) => terminal.open_session().await.map(AnySession::Mock),
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(terminal) => terminal.open_session().await.map(AnySession::Pcsc),
        }
    }
}

/// Enum wrapper for device subsystem dispatch.
#[derive(Debug)]
pub enum AnySubsystem {
    /// Mock subsystem.
    Mock(MockSubsystem),

    /// Platform PC/SC service.
    #[cfg(feature = "hardware-pcsc")]
    Pcsc(PcscSubsystem),
}

impl DeviceSubsystem for AnySubsystem {
    type Terminal = AnyTerminal;

    async fn list_terminals(&self) -> Result<Vec<String>> {
        match self {
            Self::Mock(subsystem) => subsystem.list_terminals().await,
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(subsystem) => subsystem.list_terminals().await,
        }
    }

    async fn open_terminal(&self, name: &str) -> Result<AnyTerminal> {
        match self {
            Self::Mock(subsystem) => subsystem.open_terminal(name).await.map(AnyTerminal::Mock),
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(subsystem) => subsystem.open_terminal(name).await.map(AnyTerminal::Pcsc),
        }
    }

    async fn reinitialize(&self) -> Result<()> {
        match self {
            Self::Mock(subsystem) => subsystem.reinitialize().await,
            #[cfg(feature = "hardware-pcsc")]
            Self::Pcsc(subsystem) => subsystem.reinitialize().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCard;

    #[tokio::test]
    async fn test_any_subsystem_opens_any_terminal() {
        let mock = MockSubsystem::new();
        let handle = mock.add_terminal("T1");
        let subsystem = AnySubsystem::Mock(mock);

        let terminal = subsystem.open_terminal("T1").await.unwrap();
        assert_eq!(terminal.name(), "T1");
        assert!(matches!(terminal, AnyTerminal::Mock(_)));

        handle.insert_card(MockCard::new(vec![0x3B]).with_default_response(vec![0x90, 0x00]));
        assert!(terminal.wait_for_present(Duration::from_millis(10)).await.unwrap());

        let mut session = terminal.open_session().await.unwrap();
        assert_eq!(session.atr(), &[0x3B]);
        assert_eq!(session.transmit(&[0x00]).await.unwrap(), vec![0x90, 0x00]);
    }
}
