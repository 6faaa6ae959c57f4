//! Log level mapping and the injectable log-writer seam.
//!
//! The client logs through `tracing` throughout. Embedders pick where
//! those entries go by injecting a [`LogWriter`] via
//! [`HubConnectionBuilder::with_logging`](crate::builder::HubConnectionBuilder::with_logging):
//! the builder installs a `tracing-subscriber` fmt subscriber that filters
//! at the configured [`TraceLevel`] and hands every formatted entry to the
//! writer. Embedders that already installed their own global subscriber
//! can skip all of this — installation is a no-op when a subscriber
//! exists.

use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Log verbosity filter, ordered from quietest to loudest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TraceLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl From<TraceLevel> for LevelFilter {
    fn from(level: TraceLevel) -> Self {
        match level {
            TraceLevel::Error => LevelFilter::ERROR,
            TraceLevel::Warning => LevelFilter::WARN,
            TraceLevel::Info => LevelFilter::INFO,
            TraceLevel::Debug => LevelFilter::DEBUG,
        }
    }
}

/// Sink for formatted log entries.
///
/// Implementations route entries to whatever the platform offers: a
/// console, a serial port, a ring buffer. [`StdoutLogWriter`] is the
/// default.
pub trait LogWriter: Send + Sync {
    /// Write one formatted entry. Entries arrive newline-terminated.
    fn write(&self, entry: &str);
}

/// The default writer: standard output.
pub struct StdoutLogWriter;

impl LogWriter for StdoutLogWriter {
    fn write(&self, entry: &str) {
        print!("{entry}");
    }
}

/// Adapts a [`LogWriter`] to the `io::Write` surface the fmt subscriber
/// emits into. The subscriber writes one formatted entry per call.
struct EntryWriter(Arc<dyn LogWriter>);

impl std::io::Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct MakeEntryWriter(Arc<dyn LogWriter>);

impl<'a> MakeWriter<'a> for MakeEntryWriter {
    type Writer = EntryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EntryWriter(Arc::clone(&self.0))
    }
}

/// Install a global subscriber at `level` writing to standard output.
/// A no-op if a subscriber is already installed.
pub fn init(level: TraceLevel) {
    init_with_writer(level, Arc::new(StdoutLogWriter));
}

/// Install a global subscriber at `level` routing formatted entries to
/// `writer`. A no-op if a subscriber is already installed.
pub fn init_with_writer(level: TraceLevel, writer: Arc<dyn LogWriter>) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(level))
        .with_writer(MakeEntryWriter(writer))
        .try_init();
}
