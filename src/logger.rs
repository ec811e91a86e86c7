use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::AppError;
use crate::settings::LogSettings;

/// Appends to `engine-YYYY-MM-DD.log`, reopening when the date rolls over.
#[derive(Clone)]
pub struct DailyFileWriter {
    log_dir: PathBuf,
    state: Arc<Mutex<Option<(String, File)>>>,
}

impl DailyFileWriter {
    pub fn new(log_dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            state: Arc::new(Mutex::new(None)),
        })
    }

    fn file_name_for_today() -> String {
        let now = chrono::Local::now();
        format!("engine-{}.log", now.format("%Y-%m-%d"))
    }

    pub fn current_path(&self) -> PathBuf {
        self.log_dir.join(Self::file_name_for_today())
    }

    fn write_line(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;

        let today = Self::file_name_for_today();
        let stale = match guard.as_ref() {
            Some((name, _)) => name != &today,
            None => true,
        };
        if stale {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_dir.join(&today))?;
            *guard = Some((today, file));
        }

        match guard.as_mut() {
            Some((_, file)) => {
                file.write_all(buf)?;
                file.flush()?;
                Ok(buf.len())
            }
            None => Ok(0),
        }
    }
}

pub struct DailyFileHandle {
    writer: DailyFileWriter,
}

impl Write for DailyFileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write_line(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DailyFileWriter {
    type Writer = DailyFileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        DailyFileHandle {
            writer: self.clone(),
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. Safe to call twice; the second call is a no-op.
pub fn init_logging(settings: &LogSettings) -> Result<(), AppError> {
    let level = parse_level(&settings.level);
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true);

    let result = match &settings.directory {
        Some(dir) => {
            let writer = DailyFileWriter::new(dir)?;
            builder.with_ansi(false).with_writer(writer).try_init()
        }
        None => builder.with_writer(io::stderr).try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(target: "logger", "subscriber already installed: {}", e);
    }
    Ok(())
}
