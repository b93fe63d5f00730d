//! Transport error types for terminal operations.
//!
//! Every failure reported by a terminal, a card session or the device
//! subsystem carries a [`TransportCode`] from a closed set of known platform
//! codes. The code decides how the failure is handled through its
//! [`FaultClass`]; codes that are not recognized are always fatal.

use std::fmt;

/// Result type alias for terminal operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Known platform error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportCode {
    /// No card is inserted.
    NoSmartcard,

    /// The card was removed during an operation.
    RemovedCard,

    /// The card was reset by another party.
    ResetCard,

    /// The card did not answer to reset.
    UnresponsiveCard,

    /// The card is not powered.
    UnpoweredCard,

    /// The card and the terminal share no protocol.
    ProtocolMismatch,

    /// The terminal is no longer available (unplugged).
    ReaderUnavailable,

    /// The terminal name is not known to the subsystem.
    UnknownReader,

    /// The subsystem has no terminals at all.
    NoReadersAvailable,

    /// The device service was stopped.
    ServiceStopped,

    /// No device service is running.
    NoService,

    /// An operation timed out.
    Timeout,

    /// A blocking wait was cancelled.
    Cancelled,

    /// Any code not listed above.
    Unknown,
}

impl TransportCode {
    /// Classify this code for retry and escalation decisions.
    pub fn fault_class(&self) -> FaultClass {
        match self {
            Self::NoSmartcard
            | Self::RemovedCard
            | Self::ResetCard
            | Self::UnresponsiveCard
            | Self::UnpoweredCard
            | Self::ProtocolMismatch
            | Self::Timeout => FaultClass::RecoverableCard,
            Self::ReaderUnavailable | Self::UnknownReader => FaultClass::RecoverableDevice,
            Self::NoReadersAvailable => FaultClass::NoDevices,
            Self::ServiceStopped | Self::NoService => FaultClass::ServiceRestart,
            Self::Cancelled => FaultClass::Interrupted,
            Self::Unknown => FaultClass::Fatal,
        }
    }
}

impl fmt::Display for TransportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoSmartcard => "no smart card",
            Self::RemovedCard => "card removed",
            Self::ResetCard => "card reset",
            Self::UnresponsiveCard => "unresponsive card",
            Self::UnpoweredCard => "unpowered card",
            Self::ProtocolMismatch => "protocol mismatch",
            Self::ReaderUnavailable => "reader unavailable",
            Self::UnknownReader => "unknown reader",
            Self::NoReadersAvailable => "no readers available",
            Self::ServiceStopped => "service stopped",
            Self::NoService => "no service",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown error",
        };
        write!(f, "{}", name)
    }
}

/// How a transport fault is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Card-level problem; the read can be retried or reported for this card.
    RecoverableCard,

    /// The terminal vanished; wait for it to be attached again.
    RecoverableDevice,

    /// The subsystem has no terminals; back off and enumerate again.
    NoDevices,

    /// The subsystem service is gone; re-establish the device context.
    ServiceRestart,

    /// A wait was interrupted on purpose.
    Interrupted,

    /// Anything else.
    Fatal,
}

/// Error reported by a terminal, a card session or the device subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    /// Platform code of the failure.
    pub code: TransportCode,

    /// Human-readable context.
    pub message: String,
}

impl TransportError {
    /// Create a new transport error.
    pub fn new(code: TransportCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an error for a terminal that is no longer attached.
    pub fn reader_unavailable(device: impl Into<String>) -> Self {
        Self::new(TransportCode::ReaderUnavailable, device)
    }

    /// Create an error for a card that left the terminal mid-operation.
    pub fn removed_card(device: impl Into<String>) -> Self {
        Self::new(TransportCode::RemovedCard, device)
    }

    /// Classify this error.
    pub fn fault_class(&self) -> FaultClass {
        self.code.fault_class()
    }

    /// Whether this error means the terminal itself is gone.
    pub fn is_device_gone(&self) -> bool {
        self.fault_class() == FaultClass::RecoverableDevice
    }
}
