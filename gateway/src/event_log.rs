//! Sequence-numbered event log.
//!
//! Lifecycle events reach the log through [`EventLogLayer`], a `tracing` layer
//! that forwards every INFO-and-above event over a channel to a dedicated
//! writer thread. Each line reads
//!
//! ```text
//! <seq> <unix-ts> <COMPONENT>: <message> [field=value ...]
//! ```
//!
//! where the component is the emitting thread's name in upper case. Closing
//! the log drops the only sender, which ends the writer once it has written
//! everything still queued.

use arc_swap::ArcSwapOption;
use crossbeam::channel::{self, Receiver, Sender};
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::{unix_timestamp, Result};

#[derive(Debug, Clone, PartialEq)]
struct LogRecord {
    timestamp: i64,
    component: String,
    message: String,
}

type SharedSender = Arc<ArcSwapOption<Sender<LogRecord>>>;

/// Owner of the writer thread.
pub struct EventLog {
    sender: SharedSender,
    writer: Option<JoinHandle<io::Result<u64>>>,
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Self::start(file)
    }

    pub fn start<W>(out: W) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let writer = thread::Builder::new()
            .name("event-log".to_string())
            .spawn(move || write_records(rx, BufWriter::new(out)))?;

        Ok(EventLog {
            sender: Arc::new(ArcSwapOption::from_pointee(tx)),
            writer: Some(writer),
        })
    }

    pub fn layer(&self) -> EventLogLayer {
        EventLogLayer {
            sender: self.sender.clone(),
            max_level: Level::INFO,
        }
    }

    /// Stops accepting events and waits for the writer to finish. Returns the
    /// number of lines written.
    pub fn close(mut self) -> Result<u64> {
        self.sender.store(None);
        match self.writer.take() {
            Some(writer) => match writer.join() {
                Ok(written) => Ok(written?),
                Err(_) => Err(io::Error::other("event log writer panicked").into()),
            },
            None => Ok(0),
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.sender.store(None);
    }
}

fn write_records<W: Write>(records: Receiver<LogRecord>, mut out: W) -> io::Result<u64> {
    let mut seq = 0u64;
    for record in records {
        writeln!(
            out,
            "{} {} {}: {}",
            seq, record.timestamp, record.component, record.message
        )?;
        out.flush()?;
        seq += 1;
    }
    out.flush()?;
    Ok(seq)
}

/// `tracing` layer feeding the event log. Events emitted after the log was
/// closed are dropped.
#[derive(Clone)]
pub struct EventLogLayer {
    sender: SharedSender,
    max_level: Level,
}

impl<S> Layer<S> for EventLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > self.max_level {
            return;
        }
        let guard = self.sender.load();
        let Some(sender) = guard.as_ref() else {
            return;
        };

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let _ = sender.send(LogRecord {
            timestamp: unix_timestamp(),
            component: component_name(),
            message: visitor.finish(),
        });
    }
}

fn component_name() -> String {
    match thread::current().name() {
        Some(name) if name != "main" => name.to_uppercase(),
        _ => "MAIN".to_string(),
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(mut self) -> String {
        self.message.push_str(&self.fields);
        self.message
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;
    use tracing::{debug, info, warn};
    use tracing_subscriber::layer::SubscriberExt;

    fn emit_on(thread_name: &str, layer: EventLogLayer, f: fn()) {
        thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let subscriber = tracing_subscriber::registry().with(layer);
                tracing::subscriber::with_default(subscriber, f);
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[rstest]
    fn test_lines_are_numbered_and_tagged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.log");
        let log = EventLog::open(&path).unwrap();

        emit_on("connmgr", log.layer(), || {
            info!("sensor node connected with id {}", 15);
            debug!("not logged");
            warn!(token = 3, "removing node");
        });
        emit_on("storagemgr", log.layer(), || {
            info!("connection to database established");
        });

        assert_eq!(log.close().unwrap(), 3);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let strip_ts = |line: &str| {
            let mut parts = line.splitn(3, ' ');
            let seq = parts.next().unwrap().to_string();
            let ts: i64 = parts.next().unwrap().parse().unwrap();
            assert!(ts > 1_640_000_000);
            format!("{} {}", seq, parts.next().unwrap())
        };
        assert_eq!(
            strip_ts(lines[0]),
            "0 CONNMGR: sensor node connected with id 15"
        );
        assert_eq!(strip_ts(lines[1]), "1 CONNMGR: removing node token=3");
        assert_eq!(
            strip_ts(lines[2]),
            "2 STORAGEMGR: connection to database established"
        );
    }

    #[rstest]
    fn test_events_after_close_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.log");
        let log = EventLog::open(&path).unwrap();
        let layer = log.layer();

        assert_eq!(log.close().unwrap(), 0);
        emit_on("datamgr", layer, || info!("too late"));

        assert!(std::fs::read_to_string(&path).unwrap().is_empty());
    }

    #[rstest]
    fn test_str_fields_render_unquoted() {
        let mut visitor = LineVisitor::default();
        visitor.message.push_str("stopping");
        visitor.fields.push_str(" reason=idle");

        assert_eq!(visitor.finish(), "stopping reason=idle");
    }
}
