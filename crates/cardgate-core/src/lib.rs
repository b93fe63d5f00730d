//! Shared vocabulary for the card terminal fleet.
//!
//! This crate holds the pieces every other crate agrees on: the [`Status`]
//! enumeration shown for each terminal and for the fleet as a whole, the
//! [`FleetConfig`] read at construction, and the configuration defaults in
//! [`constants`].

pub mod config;
pub mod constants;
pub mod error;
pub mod status;

pub use config::FleetConfig;
pub use error::{Error, Result};
pub use status::Status;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
