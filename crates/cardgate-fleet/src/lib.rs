//! Card terminal fleet.
//!
//! A fleet runs one [`Terminal`] worker per attached card terminal, a single
//! [`Dispatcher`] that hands finished reads to the application one at a time,
//! and a [`FleetCoordinator`] that discovers terminals and supervises the
//! other tasks.
//!
//! ```text
//! FleetCoordinator ── spawns ──► Terminal ×N ── offer ──► PendingQueue
//!        │                                                    │
//!        └──────────── spawns ──► Dispatcher ◄──── take ──────┘
//!                                     │
//!                                     ▼
//!                                CardHandler
//! ```
//!
//! Every status is held in a [`GatedCell`], which can freeze the value it
//! shows while a result is on screen. The fleet status cell borrows the lock
//! of one terminal's cell for the time that terminal's result is processed,
//! so the fleet never shows a mix of two terminals.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cardgate_core::FleetConfig;
//! use cardgate_fleet::{ApduRecordDecoder, CardHandler, Completion, FleetCoordinator, ProcessedReader};
//! use cardgate_hardware::AnySubsystem;
//! use cardgate_hardware::mock::MockSubsystem;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Print;
//!
//! impl CardHandler for Print {
//!     fn records_available(&self, reading: ProcessedReader, done: Completion) {
//!         println!("{:?}", reading.records());
//!         done.complete();
//!     }
//!
//!     fn reading_failed(&self, reading: ProcessedReader) {
//!         println!("{} failed: {}", reading.terminal().name(), reading.status());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> cardgate_fleet::Result<()> {
//!     let subsystem = MockSubsystem::new();
//!     subsystem.add_terminal("T1");
//!
//!     let coordinator = FleetCoordinator::new(
//!         AnySubsystem::Mock(subsystem),
//!         FleetConfig::default(),
//!         Arc::new(ApduRecordDecoder::new().with_command("id", vec![0x00, 0xCA, 0x00, 0x00, 0x00])),
//!         Arc::new(Print),
//!     );
//!     let control = coordinator.control();
//!     control.status().subscribe(|old, new| println!("{old} -> {new}"));
//!
//!     coordinator.run(CancellationToken::new()).await
//! }
//! ```

pub mod aggregate;
pub mod cell;
pub mod coordinator;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod pause;
pub mod queue;
pub mod registry;
pub mod signal;
pub mod snapshot;
pub mod terminal;

pub use aggregate::{TerminalPhase, aggregate};
pub use cell::{GatedCell, ListenerId, LockListener, Lockable, ValueListener};
pub use coordinator::{FleetControl, FleetCoordinator};
pub use decoder::{ApduRecordDecoder, CardRecords, RecordDecoder};
pub use dispatcher::Dispatcher;
pub use error::{CellError, FleetError, RecordFault, Result};
pub use handler::{CardHandler, Completion};
pub use pause::PauseGate;
pub use queue::{Keyed, PendingQueue};
pub use registry::TerminalRegistry;
pub use signal::Signal;
pub use snapshot::{CardToken, ProcessedReader};
pub use terminal::{StatusTransition, Terminal, TerminalContext};
