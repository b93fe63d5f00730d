//! Card terminal abstraction layer for the cardgate fleet.
//!
//! This crate defines how the fleet talks to physical card terminals without
//! knowing which platform service sits underneath. A terminal is anything
//! that can report card presence and open an exclusive session in which
//! command APDUs are exchanged with the card.
//!
//! # Design Philosophy
//!
//! - **Async-first**: All I/O operations are asynchronous using native `async fn`
//!   in traits (Rust 1.90 + Edition 2024 RPITIT).
//! - **Enum dispatch**: The traits are not object-safe; the fleet holds the
//!   concrete [`AnyTerminal`] / [`AnySubsystem`] wrappers instead.
//! - **Classified faults**: Every failure carries a [`TransportCode`] and
//!   maps to exactly one [`FaultClass`]. Unknown codes are fatal.
//!
//! # Backends
//!
//! - [`mock`]: programmable terminals and cards for tests and the demo binary.
//! - `pcsc` (feature `hardware-pcsc`): the platform PC/SC service.
//!
//! # Examples
//!
//! ```
//! use cardgate_hardware::mock::{MockCard, MockSubsystem};
//! use cardgate_hardware::{DeviceSubsystem, TerminalChannel, CardChannel};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> cardgate_hardware::Result<()> {
//!     let subsystem = MockSubsystem::new();
//!     let handle = subsystem.add_terminal("T1");
//!     handle.insert_card(MockCard::new(vec![0x3B]).with_default_response(vec![0x90, 0x00]));
//!
//!     for name in subsystem.list_terminals().await? {
//!         let terminal = subsystem.open_terminal(&name).await?;
//!         if terminal.wait_for_present(Duration::from_millis(10)).await? {
//!             let mut session = terminal.open_session().await?;
//!             let response = session.transmit(&[0x00, 0xB0, 0x00, 0x00, 0x00]).await?;
//!             assert_eq!(response, vec![0x90, 0x00]);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod devices;
pub mod error;
pub mod mock;
#[cfg(feature = "hardware-pcsc")]
pub mod pcsc;
pub mod traits;

// Re-export commonly used types for convenience
pub use devices::{AnySession, AnySubsystem, AnyTerminal};
pub use error::{FaultClass, Result, TransportCode, TransportError};
pub use traits::{CardChannel, DeviceSubsystem, TerminalChannel};
