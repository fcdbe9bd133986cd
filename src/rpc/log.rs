//! Append-only server log
//!
//! One line per event: `[<unix_timestamp>] <message>\n`. Writes from the
//! accept loop and every connection worker are serialized by a mutex.

use crate::error::{Error, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where a server writes its log
#[derive(Default)]
pub enum LogDestination {
    /// `root/logs/upc_<name>.log`, truncated at start and closed at stop
    #[default]
    Internal,
    /// A caller supplied sink. The server owns it from then on; pass a
    /// duplicate (e.g. `File::try_clone`) to keep using the original.
    Writer(Box<dyn Write + Send>),
    /// No log file; events still go to `tracing`
    Disabled,
}

impl fmt::Debug for LogDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogDestination::Internal => f.write_str("Internal"),
            LogDestination::Writer(_) => f.write_str("Writer(..)"),
            LogDestination::Disabled => f.write_str("Disabled"),
        }
    }
}

pub(crate) struct ServerLog {
    sink: Mutex<Option<Box<dyn Write + Send>>>,
    path: Option<PathBuf>,
}

impl ServerLog {
    pub(crate) fn open(destination: LogDestination, logs_dir: &Path, name: &str) -> Result<Self> {
        let (sink, path): (Option<Box<dyn Write + Send>>, _) = match destination {
            LogDestination::Internal => {
                let path = logs_dir.join(super::log_file_name(name));
                let file: File = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o666)
                    .open(&path)
                    .map_err(|e| Error::from_os(format!("opening log {}", path.display()), e))?;
                (Some(Box::new(file)), Some(path))
            }
            LogDestination::Writer(writer) => (Some(writer), None),
            LogDestination::Disabled => (None, None),
        };

        Ok(Self {
            sink: Mutex::new(sink),
            path,
        })
    }

    /// Path of the internally opened log file
    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event. Write failures drop the line.
    pub(crate) fn write(&self, message: &str) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = sink.as_mut() {
            let line = format_line(unix_timestamp(), message);
            let _ = sink.write_all(line.as_bytes());
        }
    }

    pub(crate) fn flush(&self) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = sink.as_mut() {
            let _ = sink.flush();
        }
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub(crate) fn format_line(timestamp: u64, message: &str) -> String {
    format!("[{timestamp}] {message}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_line_format() {
        assert_eq!(format_line(1_700_000_000, "listening"), "[1700000000] listening\n");
    }

    #[test]
    fn test_internal_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = ServerLog::open(LogDestination::Internal, dir.path(), "cam").unwrap();
        log.write("first");
        log.write("second");
        log.flush();

        let path = log.path().unwrap().to_path_buf();
        assert_eq!(path, dir.path().join("upc_cam.log"));
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }

    #[test]
    fn test_internal_log_truncates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("upc_cam.log"), "stale\n").unwrap();
        let log = ServerLog::open(LogDestination::Internal, dir.path(), "cam").unwrap();
        log.flush();
        assert_eq!(std::fs::read_to_string(dir.path().join("upc_cam.log")).unwrap(), "");
    }

    #[test]
    fn test_writer_destination() {
        let capture = Capture::default();
        let log = ServerLog::open(
            LogDestination::Writer(Box::new(capture.clone())),
            Path::new("/nonexistent"),
            "cam",
        )
        .unwrap();
        assert!(log.path().is_none());
        log.write("hello");
        let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(text.ends_with("] hello\n"));
    }

    #[test]
    fn test_disabled_destination() {
        let log = ServerLog::open(LogDestination::Disabled, Path::new("/nonexistent"), "cam").unwrap();
        log.write("ignored");
        assert!(log.path().is_none());
    }
}
