//! Where decoded events go.

use std::io::Write;

use anyhow::Result;
use log::info;
use serde::Deserialize;

use crate::codec::Event;

/// Receives every decoded event, in ring buffer order.
pub trait EventSink {
    fn emit(&mut self, event: &Event) -> Result<()>;
}

impl<K: EventSink + ?Sized> EventSink for &mut K {
    fn emit(&mut self, event: &Event) -> Result<()> {
        (**self).emit(event)
    }
}

impl<K: EventSink + ?Sized> EventSink for Box<K> {
    fn emit(&mut self, event: &Event) -> Result<()> {
        (**self).emit(event)
    }
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: &Event) -> Result<()> {
        self.push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One `info!` line per event.
    #[default]
    Log,
    /// One JSON object per line on stdout.
    Json,
}

impl OutputFormat {
    pub fn sink(self) -> Box<dyn EventSink> {
        match self {
            OutputFormat::Log => Box::new(LogSink),
            OutputFormat::Json => Box::new(JsonSink::new(std::io::stdout())),
        }
    }
}

#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, event: &Event) -> Result<()> {
        info!(
            "pid={} file={} ret={}",
            event.pid(),
            event.file_name_lossy(),
            event.ret()
        );
        Ok(())
    }
}

/// Newline-delimited JSON.
pub struct JsonSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for JsonSink<W> {
    fn emit(&mut self, event: &Event) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
