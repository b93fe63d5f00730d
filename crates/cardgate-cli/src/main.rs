//! `cardgate`: run a card terminal fleet and log every read.
//!
//! ```text
//! cardgate [CONFIG.json]
//! ```
//!
//! The optional argument is a JSON file with [`FleetConfig`] fields; missing
//! fields keep their defaults. Log output is controlled with `RUST_LOG`.
//!
//! Built with the `hardware-pcsc` feature the fleet uses the platform PC/SC
//! service. Otherwise it runs against two simulated terminals that get a
//! card inserted and removed every few seconds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cardgate_core::FleetConfig;
use cardgate_fleet::{
    ApduRecordDecoder, CardHandler, Completion, FleetCoordinator, ProcessedReader,
};
use cardgate_hardware::AnySubsystem;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// PC/SC pseudo-APDU returning the card UID.
const GET_UID: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Logs every result and completes right away.
struct LogHandler;

impl CardHandler for LogHandler {
    fn records_available(&self, reading: ProcessedReader, done: Completion) {
        let terminal = reading.terminal().name();
        match reading.records().map(serde_json::to_string) {
            Some(Ok(records)) => info!(terminal = %terminal, card = ?reading.card(), %records, "Card accepted"),
            Some(Err(err)) => warn!(terminal = %terminal, error = %err, "Could not serialize records"),
            None => warn!(terminal = %terminal, "Result without records"),
        }
        done.complete();
    }

    fn reading_failed(&self, reading: ProcessedReader) {
        warn!(
            terminal = %reading.terminal().name(),
            status = %reading.status(),
            "{}",
            reading.status().message()
        );
    }
}

fn load_config(path: Option<&Path>) -> Result<FleetConfig> {
    let config: FleetConfig = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => FleetConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "hardware-pcsc")]
fn subsystem(_cancel: &CancellationToken) -> Result<AnySubsystem> {
    let subsystem = cardgate_hardware::pcsc::PcscSubsystem::establish()
        .context("Failed to establish the PC/SC context")?;
    Ok(AnySubsystem::Pcsc(subsystem))
}

#[cfg(not(feature = "hardware-pcsc"))]
fn subsystem(cancel: &CancellationToken) -> Result<AnySubsystem> {
    let mock = cardgate_hardware::mock::MockSubsystem::new();
    for (index, name) in ["Demo Reader 0", "Demo Reader 1"].into_iter().enumerate() {
        let handle = mock.add_terminal(name);
        tokio::spawn(demo::simulate(handle, index as u8, cancel.clone()));
    }
    Ok(AnySubsystem::Mock(mock))
}

#[cfg(not(feature = "hardware-pcsc"))]
mod demo {
    use std::time::Duration;

    use cardgate_hardware::mock::{MockCard, MockTerminalHandle};
    use tokio_util::sync::CancellationToken;

    use super::GET_UID;

    /// Insert and remove a card now and then; every third card is unreadable.
    pub async fn simulate(handle: MockTerminalHandle, index: u8, cancel: CancellationToken) {
        let offset = Duration::from_millis(1500 * u64::from(index));
        let mut serial: u8 = 0;

        loop {
            serial = serial.wrapping_add(1);
            let card = if serial % 3 == 0 {
                MockCard::new(vec![0x3B, index, serial])
            } else {
                MockCard::new(vec![0x3B, index, serial])
                    .with_response(GET_UID.to_vec(), vec![0x04, index, serial, 0x90, 0x00])
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(3) + offset) => {}
            }
            handle.insert_card(card);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(4)) => {}
            }
            handle.remove_card();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = load_config(path.as_deref())?;
    info!(?config, "Configuration loaded");

    let cancel = CancellationToken::new();
    let decoder = ApduRecordDecoder::new().with_command("uid", GET_UID.to_vec());
    let coordinator = FleetCoordinator::new(
        subsystem(&cancel)?,
        config,
        Arc::new(decoder),
        Arc::new(LogHandler),
    );

    let control = coordinator.control();
    control
        .status()
        .subscribe(|old, new| info!(from = %old, to = %new, "Fleet status changed"));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                shutdown.cancel();
            }
            Err(err) => error!(error = %err, "Could not listen for Ctrl-C"),
        }
    });

    let result = coordinator.run(cancel.clone()).await;
    cancel.cancel();
    if let Err(err) = result {
        error!(error = %err, "Fleet stopped on a fatal fault");
        return Err(err.into());
    }

    info!("Fleet stopped");
    Ok(())
}
