//! PC/SC terminals through the platform smart card service.
//!
//! The `pcsc` crate exposes blocking calls only, so every call runs on the
//! Tokio blocking pool. Presence waits use `SCardGetStatusChange` with the
//! caller's timeout, which keeps cancellation latency bounded by the poll
//! interval chosen by the fleet.

use std::ffi::CString;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pcsc::{Attribute, Card, Context, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, info};

use crate::error::{Result, TransportCode, TransportError};
use crate::traits::{CardChannel, DeviceSubsystem, TerminalChannel};

impl From<pcsc::Error> for TransportError {
    fn from(error: pcsc::Error) -> Self {
        let code = match error {
            pcsc::Error::NoSmartcard => TransportCode::NoSmartcard,
            pcsc::Error::RemovedCard => TransportCode::RemovedCard,
            pcsc::Error::ResetCard => TransportCode::ResetCard,
            pcsc::Error::UnresponsiveCard => TransportCode::UnresponsiveCard,
            pcsc::Error::UnpoweredCard => TransportCode::UnpoweredCard,
            pcsc::Error::ProtoMismatch => TransportCode::ProtocolMismatch,
            pcsc::Error::ReaderUnavailable => TransportCode::ReaderUnavailable,
            pcsc::Error::UnknownReader => TransportCode::UnknownReader,
            pcsc::Error::NoReadersAvailable => TransportCode::NoReadersAvailable,
            pcsc::Error::ServiceStopped => TransportCode::ServiceStopped,
            pcsc::Error::NoService => TransportCode::NoService,
            pcsc::Error::Timeout => TransportCode::Timeout,
            pcsc::Error::Cancelled => TransportCode::Cancelled,
            _ => TransportCode::Unknown,
        };
        TransportError::new(code, error.to_string())
    }
}

async fn blocking<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| TransportError::new(TransportCode::Unknown, e.to_string()))?
}

fn wait_for_state(
    context: &Context,
    name: &CString,
    want_card: bool,
    timeout: Duration,
) -> Result<bool> {
    let mut states = [ReaderState::new(name.clone(), State::UNAWARE)];
    context.get_status_change(Some(Duration::ZERO), &mut states)?;

    loop {
        let event = states[0].event_state();
        if event.intersects(State::UNKNOWN | State::UNAVAILABLE | State::IGNORE) {
            return Err(TransportError::reader_unavailable(name.to_string_lossy()));
        }
        if event.contains(State::PRESENT) == want_card {
            return Ok(true);
        }

        states[0].sync_current_state();
        match context.get_status_change(Some(timeout), &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
}

/// A card terminal reached through PC/SC.
pub struct PcscTerminal {
    context: Context,
    name: CString,
    display_name: String,
}

impl fmt::Debug for PcscTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTerminal")
            .field("name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl TerminalChannel for PcscTerminal {
    type Session = PcscSession;

    fn name(&self) -> &str {
        &self.display_name
    }

    async fn wait_for_present(&self, timeout: Duration) -> Result<bool> {
        let context = self.context.clone();
        let name = self.name.clone();
        blocking(move || wait_for_state(&context, &name, true, timeout)).await
    }

    async fn wait_for_absent(&self, timeout: Duration) -> Result<bool> {
        let context = self.context.clone();
        let name = self.name.clone();
        blocking(move || wait_for_state(&context, &name, false, timeout)).await
    }

    async fn is_present(&self) -> Result<bool> {
        self.wait_for_present(Duration::ZERO).await
    }

    async fn open_session(&self) -> Result<PcscSession> {
        let context = self.context.clone();
        let name = self.name.clone();

        blocking(move || {
            let card = context.connect(&name, ShareMode::Exclusive, Protocols::ANY)?;
            let atr = card
                .get_attribute_owned(Attribute::AtrString)
                .unwrap_or_default();
            debug!(terminal = %name.to_string_lossy(), atr = ?atr, "Card session opened");
            Ok(PcscSession {
                card: Arc::new(Mutex::new(card)),
                atr,
            })
        })
        .await
    }
}

/// Exclusive session with a card in a PC/SC terminal.
///
/// The card is disconnected when the session is dropped.
pub struct PcscSession {
    card: Arc<Mutex<Card>>,
    atr: Vec<u8>,
}

impl fmt::Debug for PcscSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscSession")
            .field("atr", &self.atr)
            .finish_non_exhaustive()
    }
}

impl CardChannel for PcscSession {
    fn atr(&self) -> &[u8] {
        &self.atr
    }

    async fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let card = Arc::clone(&self.card);
        let command = command.to_vec();

        blocking(move || {
            let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
            let card = card.lock();
            let response = card.transmit(&command, &mut buffer)?;
            Ok(response.to_vec())
        })
        .await
    }
}

/// The platform PC/SC service.
pub struct PcscSubsystem {
    context: Mutex<Context>,
}

impl fmt::Debug for PcscSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscSubsystem").finish_non_exhaustive()
    }
}

impl PcscSubsystem {
    /// Establish a user-scope context with the PC/SC service.
    ///
    /// # Errors
    ///
    /// Returns [`TransportCode::NoService`] when the service is not running.
    pub fn establish() -> Result<Self> {
        let context = Context::establish(Scope::User)?;
        Ok(Self {
            context: Mutex::new(context),
        })
    }

    fn context(&self) -> Context {
        self.context.lock().clone()
    }
}

impl DeviceSubsystem for PcscSubsystem {
    type Terminal = PcscTerminal;

    async fn list_terminals(&self) -> Result<Vec<String>> {
        let context = self.context();
        blocking(move || {
            let names = context.list_readers_owned()?;
            if names.is_empty() {
                return Err(TransportError::new(
                    TransportCode::NoReadersAvailable,
                    "no readers listed",
                ));
            }
            Ok(names
                .iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect())
        })
        .await
    }

    async fn open_terminal(&self, name: &str) -> Result<PcscTerminal> {
        let c_name = CString::new(name)
            .map_err(|e| TransportError::new(TransportCode::UnknownReader, e.to_string()))?;
        Ok(PcscTerminal {
            context: self.context(),
            name: c_name,
            display_name: name.to_string(),
        })
    }

    async fn reinitialize(&self) -> Result<()> {
        let context = blocking(|| Ok(Context::establish(Scope::User)?)).await?;
        *self.context.lock() = context;
        info!("PC/SC context re-established");
        Ok(())
    }
}
