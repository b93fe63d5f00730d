//! Terminal fleet coordinator.
//!
//! The [`FleetCoordinator`] owns the device subsystem. Each enumeration pass
//! spawns a [`Terminal`] worker for every name it has not seen before and
//! hands a fresh channel to every known terminal that lost its device. The
//! dispatcher and all workers run as tasks of one [`JoinSet`]; a task that
//! fails or panics stops the whole fleet.
//!
//! Faults of the subsystem itself are handled here:
//!
//! | Fault | Fleet status | Action |
//! |-------|--------------|--------|
//! | no terminals attached | `WaitingForReader` | back off, enumerate again |
//! | service stopped | `Initializing` | reinitialize the context, back off |
//! | no service | `DriverMissing` | reinitialize the context, back off |
//! | anything else | | stop with the error |
//!
//! [`FleetControl`] is the cloneable handle the application keeps to observe
//! the fleet signals and to pause or resume the fleet.

use std::sync::Arc;
use std::time::Duration;

use cardgate_core::{FleetConfig, Status};
use cardgate_hardware::{
    AnySubsystem, DeviceSubsystem, FaultClass, TransportCode, TransportError,
};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cell::GatedCell;
use crate::decoder::RecordDecoder;
use crate::dispatcher::Dispatcher;
use crate::error::{FleetError, Result};
use crate::handler::CardHandler;
use crate::registry::TerminalRegistry;
use crate::signal::Signal;
use crate::terminal::Terminal;

/// How a fleet task ended.
#[derive(Debug)]
enum TaskTermination {
    Success,
    Failed(FleetError),
    Cancelled,
    Panicked(String),
}

impl TaskTermination {
    fn classify(result: std::result::Result<Result<()>, JoinError>) -> Self {
        match result {
            Ok(Ok(())) => Self::Success,
            Ok(Err(err)) => Self::Failed(err),
            Err(err) if err.is_cancelled() => Self::Cancelled,
            Err(err) => Self::Panicked(err.to_string()),
        }
    }
}

/// Discovers terminals and supervises the fleet tasks.
pub struct FleetCoordinator {
    subsystem: AnySubsystem,
    config: FleetConfig,
    decoder: Arc<dyn RecordDecoder>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<TerminalRegistry>,
}

impl std::fmt::Debug for FleetCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetCoordinator")
            .field("subsystem", &self.subsystem)
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("terminals", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl FleetCoordinator {
    pub fn new(
        subsystem: AnySubsystem,
        config: FleetConfig,
        decoder: Arc<dyn RecordDecoder>,
        handler: Arc<dyn CardHandler>,
    ) -> Self {
        let registry = Arc::new(TerminalRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            handler,
            Arc::clone(&registry),
        ));

        Self {
            subsystem,
            config,
            decoder,
            dispatcher,
            registry,
        }
    }

    /// Handle for observing and pausing the fleet.
    pub fn control(&self) -> FleetControl {
        FleetControl {
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Run the fleet until `cancel` fires or a fatal fault occurs.
    ///
    /// Every task is cancelled and awaited before this returns.
    ///
    /// # Errors
    ///
    /// Returns the first fatal fault of the subsystem, a terminal or the
    /// dispatcher, or [`FleetError::TaskPanicked`] if one of them panicked.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Fleet coordinator started");
        self.dispatcher.status().set(Status::Initializing);

        let children = cancel.child_token();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        tasks.spawn(Arc::clone(&self.dispatcher).run(children.child_token()));

        let result = self.supervise(&mut tasks, &cancel, &children).await;

        children.cancel();
        while let Some(joined) = tasks.join_next().await {
            match TaskTermination::classify(joined) {
                TaskTermination::Failed(err) => {
                    debug!(error = %err, "Fleet task failed during shutdown");
                }
                TaskTermination::Panicked(panic) => {
                    warn!(panic = %panic, "Fleet task panicked during shutdown");
                }
                TaskTermination::Success | TaskTermination::Cancelled => {}
            }
        }

        info!("Fleet coordinator stopped");
        result
    }

    async fn supervise(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        cancel: &CancellationToken,
        children: &CancellationToken,
    ) -> Result<()> {
        loop {
            let enumerated = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                enumerated = self.subsystem.list_terminals() => enumerated,
            };

            let backoff = match enumerated {
                Ok(names) => {
                    self.attach(&names, tasks, children).await?;
                    self.config.rescan_interval()
                }
                Err(err) => match self.recover(err).await? {
                    Some(backoff) => backoff,
                    None => return Ok(()),
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
                Some(joined) = tasks.join_next() => Self::check_task(joined)?,
            }
        }
    }

    async fn attach(
        &self,
        names: &[String],
        tasks: &mut JoinSet<Result<()>>,
        children: &CancellationToken,
    ) -> Result<()> {
        for name in names {
            if let Some(terminal) = self.registry.get(name) {
                if !terminal.awaiting_device() {
                    continue;
                }
                match self.subsystem.open_terminal(name).await {
                    Ok(channel) => {
                        terminal.supply_channel(channel);
                        info!(terminal = %name, "Terminal reattached");
                    }
                    Err(err) => Self::skip_terminal(name, err)?,
                }
                continue;
            }

            let channel = match self.subsystem.open_terminal(name).await {
                Ok(channel) => channel,
                Err(err) => {
                    Self::skip_terminal(name, err)?;
                    continue;
                }
            };

            let context = self.dispatcher.terminal_context(Arc::clone(&self.decoder));
            let terminal = Arc::new(Terminal::new(channel, context));
            self.dispatcher.observe(&terminal);
            if self.registry.insert(Arc::clone(&terminal)) {
                info!(terminal = %name, "Terminal discovered");
                tasks.spawn(terminal.run(children.child_token()));
            }
        }
        Ok(())
    }

    /// Handle an enumeration fault. Returns the backoff before the next
    /// enumeration, or `None` if the wait was interrupted.
    async fn recover(&self, err: TransportError) -> Result<Option<Duration>> {
        match err.fault_class() {
            FaultClass::NoDevices => {
                debug!(error = %err, "No terminals attached");
                self.dispatcher.show_condition(Status::WaitingForReader);
                Ok(Some(self.config.no_readers_retry()))
            }
            FaultClass::ServiceRestart => {
                let (status, backoff) = match err.code {
                    TransportCode::NoService => {
                        (Status::DriverMissing, self.config.no_service_retry())
                    }
                    _ => (Status::Initializing, self.config.service_stopped_retry()),
                };
                warn!(error = %err, "Device service unavailable, reinitializing");
                self.dispatcher.show_condition(status);

                if let Err(reinit) = self.subsystem.reinitialize().await {
                    if reinit.fault_class() == FaultClass::Fatal {
                        error!(error = %reinit, "Device context reinitialization failed");
                        return Err(reinit.into());
                    }
                    warn!(error = %reinit, "Device context not reinitialized yet");
                }
                Ok(Some(backoff))
            }
            FaultClass::Interrupted => {
                info!("Enumeration interrupted");
                Ok(None)
            }
            FaultClass::RecoverableCard | FaultClass::RecoverableDevice | FaultClass::Fatal => {
                error!(error = %err, "Fatal enumeration fault");
                Err(err.into())
            }
        }
    }

    fn skip_terminal(name: &str, err: TransportError) -> Result<()> {
        if err.fault_class() == FaultClass::Fatal {
            error!(terminal = %name, error = %err, "Fatal fault opening terminal");
            return Err(err.into());
        }
        warn!(terminal = %name, error = %err, "Could not open terminal");
        Ok(())
    }

    fn check_task(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
        match TaskTermination::classify(joined) {
            TaskTermination::Success | TaskTermination::Cancelled => Ok(()),
            TaskTermination::Failed(err) => {
                error!(error = %err, "Fleet task failed");
                Err(err)
            }
            TaskTermination::Panicked(panic) => {
                error!(panic = %panic, "Fleet task panicked");
                Err(FleetError::TaskPanicked(panic))
            }
        }
    }
}

/// Cloneable handle to a running fleet.
#[derive(Debug, Clone)]
pub struct FleetControl {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<TerminalRegistry>,
}

impl FleetControl {
    /// Fleet-wide status.
    pub fn status(&self) -> &GatedCell<Status> {
        self.dispatcher.status()
    }

    /// Whether a card is present, as far as the fleet reports it.
    pub fn card_present(&self) -> &Signal<bool> {
        self.dispatcher.card_present()
    }

    /// Known terminals, ordered by name.
    pub fn terminals(&self) -> Vec<Arc<Terminal>> {
        self.registry.all()
    }

    pub fn terminal(&self, name: &str) -> Option<Arc<Terminal>> {
        self.registry.get(name)
    }

    /// Pause the dispatcher and every terminal, including ones found later.
    pub fn pause(&self) {
        self.dispatcher.pause();
        self.registry.set_paused(true);
        info!("Fleet paused");
    }

    pub fn resume(&self) {
        self.registry.set_paused(false);
        self.dispatcher.resume();
        info!("Fleet resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.dispatcher.is_paused()
    }

    /// Whether no result is queued or being processed.
    pub fn is_idle(&self) -> bool {
        self.dispatcher.is_idle()
    }

    /// Number of queued results.
    pub fn pending(&self) -> usize {
        self.dispatcher.pending()
    }
}
