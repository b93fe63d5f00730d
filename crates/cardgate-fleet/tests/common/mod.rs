//! Common helpers for the fleet integration tests.
//!
//! - [`fast_config`]: timings short enough for tests
//! - [`RecordingHandler`]: records every callback and can hold completions
//! - [`TestFleet`]: a running coordinator over a [`MockSubsystem`]
//! - [`eventually`]: poll a condition with a deadline

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cardgate_core::{FleetConfig, Status};
use cardgate_fleet::{
    ApduRecordDecoder, CardHandler, Completion, FleetControl, FleetCoordinator, ProcessedReader,
};
use cardgate_hardware::AnySubsystem;
use cardgate_hardware::mock::{MockCard, MockSubsystem};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const READ_NAME: [u8; 5] = [0x00, 0xB0, 0x00, 0x00, 0x04];
pub const READ_CODE: [u8; 5] = [0x00, 0xB0, 0x00, 0x04, 0x02];

pub fn fast_config() -> FleetConfig {
    FleetConfig {
        poll_interval_ms: 10,
        settle_delay_ms: 0,
        retry_interval_ms: 10,
        max_retries: 2,
        success_display_ms: 50,
        rescan_interval_ms: 10,
        no_readers_retry_ms: 10,
        service_stopped_retry_ms: 10,
        no_service_retry_ms: 10,
    }
}

pub fn decoder() -> ApduRecordDecoder {
    ApduRecordDecoder::new()
        .with_command("name", READ_NAME.to_vec())
        .with_command("code", READ_CODE.to_vec())
}

/// Card whose records decode to `name` and a fixed code.
pub fn card(atr: u8, name: &[u8]) -> MockCard {
    let mut response = name.to_vec();
    response.extend_from_slice(&[0x90, 0x00]);
    MockCard::new(vec![0x3B, atr])
        .with_response(READ_NAME.to_vec(), response)
        .with_response(READ_CODE.to_vec(), vec![0x12, 0x34, 0x90, 0x00])
}

/// Card that rejects every command.
pub fn rejecting_card() -> MockCard {
    MockCard::new(vec![0x3B, 0xEE])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    Records { terminal: String, name: String },
    Failed { terminal: String, status: Status },
}

/// Card handler that records its calls.
#[derive(Default)]
pub struct RecordingHandler {
    hold: bool,
    events: Mutex<Vec<HandlerEvent>>,
    held: Mutex<Vec<Completion>>,
}

impl RecordingHandler {
    /// Complete every result right away.
    pub fn completing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keep completions until [`complete_next`](Self::complete_next).
    pub fn holding() -> Arc<Self> {
        Arc::new(Self {
            hold: true,
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    /// Complete the oldest held result.
    pub fn complete_next(&self) {
        let next = {
            let mut held = self.held.lock();
            if held.is_empty() { None } else { Some(held.remove(0)) }
        };
        next.expect("no held completion").complete();
    }
}

impl CardHandler for RecordingHandler {
    fn records_available(&self, reading: ProcessedReader, done: Completion) {
        let name = reading
            .records()
            .and_then(|records| records.get("name"))
            .unwrap_or_default()
            .to_string();
        self.events.lock().push(HandlerEvent::Records {
            terminal: reading.terminal().name().to_string(),
            name,
        });
        if self.hold {
            self.held.lock().push(done);
        } else {
            done.complete();
        }
    }

    fn reading_failed(&self, reading: ProcessedReader) {
        self.events.lock().push(HandlerEvent::Failed {
            terminal: reading.terminal().name().to_string(),
            status: reading.status(),
        });
    }
}

/// A running fleet over mock terminals.
pub struct TestFleet {
    pub subsystem: MockSubsystem,
    pub control: FleetControl,
    cancel: CancellationToken,
    task: JoinHandle<cardgate_fleet::Result<()>>,
}

impl TestFleet {
    pub fn start(
        subsystem: MockSubsystem,
        config: FleetConfig,
        handler: Arc<RecordingHandler>,
    ) -> Self {
        let coordinator = FleetCoordinator::new(
            AnySubsystem::Mock(subsystem.clone()),
            config,
            Arc::new(decoder()),
            handler,
        );
        let control = coordinator.control();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(cancel.clone()));

        Self {
            subsystem,
            control,
            cancel,
            task,
        }
    }

    /// Wait until `name` is known and waits for a card.
    pub async fn ready(&self, name: &str) {
        eventually(|| {
            self.control
                .terminal(name)
                .is_some_and(|t| t.status().real() == Status::WaitingForCard)
        })
        .await;
    }

    pub fn terminal_status(&self, name: &str) -> Option<Status> {
        self.control.terminal(name).map(|t| t.status().real())
    }

    /// Wait for the fleet to stop on its own.
    pub async fn join(self) -> cardgate_fleet::Result<()> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("fleet did not stop")
            .expect("fleet task panicked")
    }

    /// Cancel the fleet and return what `run` returned.
    pub async fn shutdown(self) -> cardgate_fleet::Result<()> {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("fleet did not stop")
            .expect("fleet task panicked")
    }
}

/// Poll `condition` every few milliseconds, failing after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
