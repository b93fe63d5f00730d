//! Default timings for the terminal fleet.
//!
//! Every value here is the default of a [`FleetConfig`](crate::FleetConfig)
//! field and is expressed in milliseconds unless stated otherwise. The
//! defaults match a desk-mounted contact reader: card insertion is detected
//! within a quarter second, the contacts are given a short moment to settle
//! before the first command, and a failed read is retried twice.
//!
//! # Usage
//!
//! ```
//! use cardgate_core::constants::*;
//! use std::time::Duration;
//!
//! let poll = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);
//! assert!(poll > Duration::ZERO);
//! assert!(DEFAULT_SUCCESS_DISPLAY_MS >= 0);
//! ```

// ============================================================================
// Terminal polling
// ============================================================================

/// Upper bound of one blocking presence/absence wait on a terminal.
///
/// Cancellation is observed at least this often while a terminal waits for
/// a card to be inserted or removed.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Delay between card detection and the first command sent to it.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 300;

/// Pause between two read attempts after a recoverable card fault.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 500;

/// Number of retries after the first failed read (3 attempts in total).
pub const DEFAULT_MAX_RETRIES: u32 = 2;

// ============================================================================
// Result display
// ============================================================================

/// How long a successful read stays frozen on screen after the handler
/// completes.
///
/// A negative value keeps the result frozen until the next card event on
/// the same terminal.
pub const DEFAULT_SUCCESS_DISPLAY_MS: i64 = 3_000;

// ============================================================================
// Device enumeration
// ============================================================================

/// Interval between two enumeration passes while the subsystem is healthy.
pub const DEFAULT_RESCAN_INTERVAL_MS: u64 = 1_000;

/// Backoff after the subsystem reported that no terminals are attached.
pub const DEFAULT_NO_READERS_RETRY_MS: u64 = 2_000;

/// Backoff after the subsystem reported that its service was stopped.
pub const DEFAULT_SERVICE_STOPPED_RETRY_MS: u64 = 1_000;

/// Backoff after the subsystem reported that no service is running.
pub const DEFAULT_NO_SERVICE_RETRY_MS: u64 = 5_000;

/// Maximum number of status transitions kept per terminal.
///
/// A full read cycle is four transitions, so this covers the last 25 cards
/// seen by a terminal, which is plenty for diagnosing a misbehaving reader.
pub const MAX_TRANSITION_HISTORY: usize = 100;
