//! Newline-delimited JSON event journal (`--log-json`).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::engine::SessionStats;
use crate::registry::TrackId;

#[derive(Serialize)]
pub struct SessionStartLog {
    pub event: &'static str,
    pub timestamp: String,
    pub ledger: String,
    pub cooldown_minutes: i64,
    pub recount_policy: String,
    pub region: Option<String>,
}

#[derive(Serialize)]
pub struct NewVisitorLog {
    pub event: &'static str,
    pub timestamp: String,
    pub track_id: TrackId,
    pub date: String,
    pub hour: u32,
    pub live_count: u32,
}

#[derive(Serialize)]
pub struct HourClosedLog {
    pub event: &'static str,
    pub timestamp: String,
    pub date: String,
    pub hour: u32,
    pub count: u32,
}

#[derive(Serialize)]
pub struct SessionEndLog {
    pub event: &'static str,
    pub timestamp: String,
    #[serde(flatten)]
    pub stats: SessionStats,
}

pub struct JsonLogger<W: Write = BufWriter<File>> {
    writer: W,
}

impl JsonLogger {
    /// Appends to `path`, creating it if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLogger<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub fn timestamp_now() -> String {
    chrono::Local::now().to_rfc3339()
}
