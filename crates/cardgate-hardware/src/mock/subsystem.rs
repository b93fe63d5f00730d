//! Mock device subsystem.
//!
//! Keeps a set of [`MockTerminal`]s by name and answers enumeration the way
//! a PC/SC service does: an empty list is reported as
//! [`TransportCode::NoReadersAvailable`], and a stopped service keeps failing
//! until the context is re-established.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::terminal::{MockTerminal, MockTerminalHandle};
use crate::error::{Result, TransportCode, TransportError};
use crate::traits::DeviceSubsystem;

#[derive(Debug, Default)]
struct Inner {
    terminals: Mutex<BTreeMap<String, MockTerminalHandle>>,
    injected: Mutex<VecDeque<TransportCode>>,
    service_stopped: AtomicBool,
    enumerations: AtomicUsize,
    reinitializations: AtomicUsize,
}

/// Mock device subsystem.
///
/// Cloning yields another handle to the same subsystem, so tests can keep
/// one clone to plug terminals in while the fleet owns the other.
///
/// # Examples
///
/// ```
/// use cardgate_hardware::mock::MockSubsystem;
/// use cardgate_hardware::traits::DeviceSubsystem;
///
/// #[tokio::main]
/// async fn main() -> cardgate_hardware::Result<()> {
///     let subsystem = MockSubsystem::new();
///     assert!(subsystem.list_terminals().await.is_err());
///
///     let _t1 = subsystem.add_terminal("T1");
///     assert_eq!(subsystem.list_terminals().await?, vec!["T1".to_string()]);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockSubsystem {
    inner: Arc<Inner>,
}

impl MockSubsystem {
    /// Create a subsystem without terminals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a new terminal and return its control handle.
    ///
    /// Adding a name that already exists replaces the previous terminal.
    pub fn add_terminal(&self, name: impl Into<String>) -> MockTerminalHandle {
        let name = name.into();
        let (_terminal, handle) = MockTerminal::new(name.clone());
        self.inner.terminals.lock().insert(name, handle.clone());
        handle
    }

    /// Get the control handle of a terminal.
    pub fn terminal(&self, name: &str) -> Option<MockTerminalHandle> {
        self.inner.terminals.lock().get(name).cloned()
    }

    /// Fail the next enumeration with `code`.
    ///
    /// Several injected codes are returned in order, one per enumeration.
    pub fn fail_next_enumeration(&self, code: TransportCode) {
        self.inner.injected.lock().push_back(code);
    }

    /// Stop the service; enumeration fails until [`reinitialize`](DeviceSubsystem::reinitialize).
    pub fn stop_service(&self) {
        self.inner.service_stopped.store(true, Ordering::SeqCst);
    }

    /// Number of enumeration passes so far.
    pub fn enumerations(&self) -> usize {
        self.inner.enumerations.load(Ordering::SeqCst)
    }

    /// Number of context re-initializations so far.
    pub fn reinitializations(&self) -> usize {
        self.inner.reinitializations.load(Ordering::SeqCst)
    }
}

impl DeviceSubsystem for MockSubsystem {
    type Terminal = MockTerminal;

    async fn list_terminals(&self) -> Result<Vec<String>> {
        self.inner.enumerations.fetch_add(1, Ordering::SeqCst);

        if let Some(code) = self.inner.injected.lock().pop_front() {
            return Err(TransportError::new(code, "injected enumeration fault"));
        }

        if self.inner.service_stopped.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportCode::ServiceStopped,
                "mock service stopped",
            ));
        }

        let names: Vec<String> = self
            .inner
            .terminals
            .lock()
            .values()
            .filter(|handle| handle.is_attached())
            .map(|handle| handle.name().to_string())
            .collect();

        if names.is_empty() {
            return Err(TransportError::new(
                TransportCode::NoReadersAvailable,
                "no terminals attached",
            ));
        }

        Ok(names)
    }

    async fn open_terminal(&self, name: &str) -> Result<MockTerminal> {
        let handle = self
            .terminal(name)
            .ok_or_else(|| TransportError::new(TransportCode::UnknownReader, name))?;
        handle.open()
    }

    async fn reinitialize(&self) -> Result<()> {
        self.inner.reinitializations.fetch_add(1, Ordering::SeqCst);
        self.inner.service_stopped.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultClass;
    use crate::traits::TerminalChannel;

    #[tokio::test]
    async fn test_empty_subsystem_reports_no_readers() {
        let subsystem = MockSubsystem::new();
        let err = subsystem.list_terminals().await.unwrap_err();
        assert_eq!(err.fault_class(), FaultClass::NoDevices);
    }

    #[tokio::test]
    async fn test_detached_terminal_not_listed() {
        let subsystem = MockSubsystem::new();
        let t1 = subsystem.add_terminal("T1");
        subsystem.add_terminal("T2");

        t1.detach();
        assert_eq!(subsystem.list_terminals().await.unwrap(), vec!["T2"]);

        t1.attach();
        assert_eq!(subsystem.list_terminals().await.unwrap(), vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn test_stopped_service_until_reinitialized() {
        let subsystem = MockSubsystem::new();
        subsystem.add_terminal("T1");
        subsystem.stop_service();

        for _ in 0..2 {
            let err = subsystem.list_terminals().await.unwrap_err();
            assert_eq!(err.code, TransportCode::ServiceStopped);
        }

        subsystem.reinitialize().await.unwrap();
        assert_eq!(subsystem.reinitializations(), 1);
        assert!(subsystem.list_terminals().await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_faults_in_order() {
        let subsystem = MockSubsystem::new();
        subsystem.add_terminal("T1");
        subsystem.fail_next_enumeration(TransportCode::NoService);
        subsystem.fail_next_enumeration(TransportCode::Unknown);

        let first = subsystem.list_terminals().await.unwrap_err();
        assert_eq!(first.code, TransportCode::NoService);
        let second = subsystem.list_terminals().await.unwrap_err();
        assert_eq!(second.fault_class(), FaultClass::Fatal);
        assert!(subsystem.list_terminals().await.is_ok());
        assert_eq!(subsystem.enumerations(), 3);
    }

    #[tokio::test]
    async fn test_open_terminal() {
        let subsystem = MockSubsystem::new();
        subsystem.add_terminal("T1");

        let terminal = subsystem.open_terminal("T1").await.unwrap();
        assert_eq!(terminal.name(), "T1");

        let err = subsystem.open_terminal("T9").await.unwrap_err();
        assert_eq!(err.code, TransportCode::UnknownReader);
    }
}
