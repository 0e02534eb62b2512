//! Keyboard trigger
//!
//! Each wait performs one blocking single-byte read on a blocking thread.
//! A read that was started is not interrupted; shutdown while waiting here
//! leaves the read behind until the process exits.

use anyhow::{Context, Result};
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{TriggerEvent, TriggerSource};

type SharedReader = Arc<Mutex<Box<dyn Read + Send>>>;

pub struct KeypressTrigger {
    reader: SharedReader,
}

impl KeypressTrigger {
    /// Read keys from standard input.
    pub fn stdin() -> Self {
        Self::from_reader(io::stdin())
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Box::new(reader))),
        }
    }
}

fn read_key(reader: &SharedReader) -> io::Result<TriggerEvent> {
    let mut reader = reader.lock().unwrap_or_else(|p| p.into_inner());
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(TriggerEvent::EndOfInput),
            Ok(_) => return Ok(TriggerEvent::Key(byte[0] as char)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[async_trait::async_trait]
impl TriggerSource for KeypressTrigger {
    async fn wait_for_trigger(&mut self) -> Result<TriggerEvent> {
        let reader = self.reader.clone();
        let event = tokio::task::spawn_blocking(move || read_key(&reader))
            .await
            .context("Keyboard reader task failed")?
            .context("Failed to read keypress")?;
        debug!(?event, "Key read");
        Ok(event)
    }
}
