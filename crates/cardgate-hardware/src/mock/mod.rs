//! Mock device implementations for testing and development.
//!
//! This module provides simulated terminals and a simulated device subsystem
//! that can be controlled programmatically without requiring physical hardware.

pub mod subsystem;
pub mod terminal;

// Re-export commonly used types
pub use subsystem::MockSubsystem;
pub use terminal::{MockCard, MockSession, MockTerminal, MockTerminalHandle};
