//! Tracing subscriber setup.
//!
//! Output goes to stderr and to a log file that can be switched while the process runs: the run
//! log between scripts, each script's own log while it runs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Default)]
struct Sink {
    file: Option<File>,
    path: Option<PathBuf>,
}

/// Shared handle to the current log file. Writes are dropped while no file is open.
#[derive(Debug, Clone, Default)]
pub struct LogFile {
    sink: Arc<Mutex<Sink>>,
}

impl LogFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append all further output to `path`, creating its directory.
    pub fn switch(&self, path: &Path) -> io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(previous) = sink.file.as_mut() {
                let _ = previous.flush();
            }
            sink.file = Some(file);
            sink.path = Some(path.to_path_buf());
        }
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.sink.lock().ok().and_then(|sink| sink.path.clone())
    }

    pub fn close(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(file) = sink.file.as_mut() {
                let _ = file.flush();
            }
            sink.file = None;
            sink.path = None;
        }
    }
}

#[derive(Debug)]
pub struct LogFileWriter {
    sink: Arc<Mutex<Sink>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(file) = sink.file.as_mut() {
                file.write_all(buf)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(file) = sink.file.as_mut() {
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            sink: Arc::clone(&self.sink),
        }
    }
}

/// `RUST_LOG` wins over `level`; an unparsable level falls back to `info`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(level: &str, file: LogFile) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file))
        .try_init()
}
