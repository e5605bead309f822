// THEORY:
// The persistence boundary. The storage backend is someone else's concern; the engine only
// needs an append-only place to put events as they leave the sequencer and windows as
// they are frozen. A sink must be shareable across tasks, so every method takes `&self`.
// Events and the truncated ENDs forced by closures together form the replayable log: each
// forced END is written just before the closure that forced it, which is the order the
// aggregator applied them in.

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core_modules::alerts::Alert;
use crate::core_modules::event::DomainEvent;
use crate::core_modules::kpi_window::KpiWindow;
use crate::error::Result;

pub trait PersistenceSink: Send + Sync {
    /// An event as released by the sequencer.
    fn write_event(&self, event: &DomainEvent) -> Result<()>;

    /// A window that has just been frozen.
    fn write_window(&self, window: &KpiWindow) -> Result<()>;

    /// A truncated END synthesized by the aggregator. Replayed like any other event.
    fn write_synthetic(&self, event: &DomainEvent) -> Result<()> {
        self.write_event(event)
    }

    fn write_alert(&self, _alert: &Alert) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// One line of the JSON-lines log.
#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SinkRecord<'a> {
    Event(&'a DomainEvent),
    Synthetic(&'a DomainEvent),
    Window(&'a KpiWindow),
    Alert(&'a Alert),
}

#[derive(Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LoggedRecord {
    Event(DomainEvent),
    Synthetic(DomainEvent),
    #[serde(other)]
    Other,
}

/// Keeps everything in memory. Useful for tests and for embedding.
#[derive(Default)]
pub struct MemorySink {
    log: Mutex<Vec<DomainEvent>>,
    events: Mutex<Vec<DomainEvent>>,
    synthetic: Mutex<Vec<DomainEvent>>,
    windows: Mutex<Vec<KpiWindow>>,
    alerts: Mutex<Vec<Alert>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events and forced ENDs in the order they were written.
    pub fn log(&self) -> Vec<DomainEvent> {
        self.log.lock().clone()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn synthetic(&self) -> Vec<DomainEvent> {
        self.synthetic.lock().clone()
    }

    pub fn windows(&self) -> Vec<KpiWindow> {
        self.windows.lock().clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl PersistenceSink for MemorySink {
    fn write_event(&self, event: &DomainEvent) -> Result<()> {
        self.log.lock().push(event.clone());
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn write_window(&self, window: &KpiWindow) -> Result<()> {
        self.windows.lock().push(window.clone());
        Ok(())
    }

    fn write_synthetic(&self, event: &DomainEvent) -> Result<()> {
        self.log.lock().push(event.clone());
        self.synthetic.lock().push(event.clone());
        Ok(())
    }

    fn write_alert(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

/// Append-only JSON-lines log, one `SinkRecord` per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn append(&self, record: &SinkRecord<'_>) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write + Send> PersistenceSink for JsonLinesSink<W> {
    fn write_event(&self, event: &DomainEvent) -> Result<()> {
        self.append(&SinkRecord::Event(event))
    }

    fn write_window(&self, window: &KpiWindow) -> Result<()> {
        self.append(&SinkRecord::Window(window))
    }

    fn write_synthetic(&self, event: &DomainEvent) -> Result<()> {
        self.append(&SinkRecord::Synthetic(event))
    }

    fn write_alert(&self, alert: &Alert) -> Result<()> {
        self.append(&SinkRecord::Alert(alert))
    }

    fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

/// Reads the replayable records, events and forced ENDs, back out of a JSON-lines log in
/// file order. Windows and alerts are skipped.
pub fn read_event_log(reader: impl BufRead) -> Result<Vec<DomainEvent>> {
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line)? {
            LoggedRecord::Event(event) | LoggedRecord::Synthetic(event) => events.push(event),
            LoggedRecord::Other => {}
        }
    }
    Ok(events)
}
