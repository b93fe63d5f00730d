//! Card record decoding.
//!
//! A [`RecordDecoder`] turns an open card session into [`CardRecords`]. It is
//! called once per read attempt, with the terminal's exclusive session, and
//! reports failures as [`RecordFault`]s; only APDU faults are retried.
//!
//! [`ApduRecordDecoder`] covers cards whose records are read with a fixed
//! list of commands: each answer must end in `90 00` and its data becomes
//! one hex-encoded field.

use std::fmt;

use cardgate_hardware::{AnySession, CardChannel};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::trace;

use crate::error::RecordFault;

/// Status word of a successful command.
pub const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// Named fields decoded from one card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardRecords {
    fields: Vec<(String, String)>,
    read_at: DateTime<Utc>,
}

impl CardRecords {
    /// Create records read now.
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self {
            fields,
            read_at: Utc::now(),
        }
    }

    /// Value of the field called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    /// All fields, in read order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// When the card was read.
    pub fn read_at(&self) -> DateTime<Utc> {
        self.read_at
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field was read.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Decodes the records of the card behind an open session.
///
/// Implementations are shared by every terminal of the fleet.
pub trait RecordDecoder: Send + Sync {
    /// Read and decode the records of the card.
    fn decode<'a>(
        &'a self,
        session: &'a mut AnySession,
    ) -> BoxFuture<'a, Result<CardRecords, RecordFault>>;
}

/// Reads a fixed list of named APDUs.
///
/// # Examples
///
/// ```
/// use cardgate_fleet::ApduRecordDecoder;
///
/// let decoder = ApduRecordDecoder::new()
///     .with_command("name", vec![0x00, 0xB0, 0x00, 0x00, 0x20])
///     .with_command("expiry", vec![0x00, 0xB0, 0x00, 0x20, 0x04]);
/// assert_eq!(decoder.len(), 2);
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ApduRecordDecoder {
    commands: Vec<(String, Vec<u8>)>,
}

impl fmt::Debug for ApduRecordDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.commands.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ApduRecordDecoder")
            .field("fields", &names)
            .finish()
    }
}

impl ApduRecordDecoder {
    /// Create a decoder without commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the field `name` with `command`.
    pub fn with_command(mut self, name: impl Into<String>, command: Vec<u8>) -> Self {
        self.commands.push((name.into(), command));
        self
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no command is configured.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    async fn read_all(&self, session: &mut AnySession) -> Result<CardRecords, RecordFault> {
        let mut fields = Vec::with_capacity(self.commands.len());

        for (name, command) in &self.commands {
            let response = session.transmit(command).await?;
            let data = split_status(&response)?;
            trace!(field = %name, len = data.len(), "Record field read");
            fields.push((name.clone(), hex::encode_upper(data)));
        }

        Ok(CardRecords::new(fields))
    }
}

impl RecordDecoder for ApduRecordDecoder {
    fn decode<'a>(
        &'a self,
        session: &'a mut AnySession,
    ) -> BoxFuture<'a, Result<CardRecords, RecordFault>> {
        Box::pin(self.read_all(session))
    }
}

/// Split a response into its data and check the trailing status word.
fn split_status(response: &[u8]) -> Result<&[u8], RecordFault> {
    let Some((data, sw)) = response.split_last_chunk::<2>() else {
        return Err(RecordFault::Malformed(format!(
            "response of {} bytes has no status word",
            response.len()
        )));
    };

    if *sw != SW_SUCCESS {
        return Err(RecordFault::Apdu {
            sw1: sw[0],
            sw2: sw[1],
        });
    }

    Ok(data)
}
