//! File logging for the layer.
//!
//! The layer runs inside someone else's process, so there is no console to
//! print to. Everything logged through the `log` facade ends up in daily
//! files under the layer's data directory, with size-based rotation and
//! cleanup of old files.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{LevelFilter, Log, Metadata, Record};

use crate::error::{PassthroughResult, ResultExt};

/// Maximum log file size before rotation (5MB)
const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of log files to keep
const MAX_LOG_FILES: usize = 5;

/// Log file name prefix
const LOG_PREFIX: &str = "wmr_passthrough";

lazy_static::lazy_static! {
    /// Global log file handle
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
    /// Log directory path
    static ref LOG_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
}

/// `log` backend writing to [`LOG_FILE`].
pub struct FileLogger;

static LOGGER: FileLogger = FileLogger;

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        write_line(&format_line(record.level(), record.target(), &record.args().to_string()));
    }

    fn flush(&self) {
        if let Ok(mut log_file) = LOG_FILE.lock() {
            if let Some(ref mut file) = *log_file {
                let _ = file.flush();
            }
        }
    }
}

/// Initialize the logging system under `log_dir` and install the logger.
///
/// Safe to call more than once: the file is re-opened, the logger is only
/// installed the first time.
pub fn init_logging(log_dir: &Path, level: LevelFilter) -> PassthroughResult<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    {
        let mut dir = LOG_DIR
            .lock()
            .map_err(|e| format!("Failed to acquire log directory lock: {}", e))?;
        *dir = Some(log_dir.to_path_buf());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(get_current_log_path(log_dir))
        .context("Failed to open log file")?;

    {
        let mut log_file = LOG_FILE
            .lock()
            .map_err(|e| format!("Failed to acquire log file lock: {}", e))?;
        *log_file = Some(file);
    }

    // Another logger (tests, host) may already be installed.
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }

    log::info!("Logging to {:?}", log_dir);

    cleanup_old_logs(log_dir);

    Ok(())
}

/// Get the path for the current log file (one per day)
fn get_current_log_path(log_dir: &Path) -> PathBuf {
    let date = Local::now().format("%Y-%m-%d");
    log_dir.join(format!("{}_{}.log", LOG_PREFIX, date))
}

fn format_line(level: log::Level, target: &str, message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    format!("[{}] [{}] [{}] {}\n", timestamp, level, target, message)
}

/// Clean up old log files, keeping only the most recent MAX_LOG_FILES
fn cleanup_old_logs(log_dir: &Path) {
    if let Ok(entries) = fs::read_dir(log_dir) {
        let mut log_files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "log")
                    .unwrap_or(false)
            })
            .collect();

        // Newest first
        log_files.sort_by(|a, b| {
            let a_time = a.metadata().and_then(|m| m.modified()).ok();
            let b_time = b.metadata().and_then(|m| m.modified()).ok();
            b_time.cmp(&a_time)
        });

        for file in log_files.into_iter().skip(MAX_LOG_FILES) {
            let _ = fs::remove_file(file.path());
        }
    }
}

/// Check if log rotation is needed and rotate if necessary
fn check_rotation() {
    // A poisoned lock skips rotation rather than panicking inside the host.
    let log_dir = {
        let dir = match LOG_DIR.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match dir.as_ref() {
            Some(d) => d.clone(),
            None => return,
        }
    };

    let current_path = get_current_log_path(&log_dir);

    if let Ok(metadata) = fs::metadata(&current_path) {
        if metadata.len() > MAX_LOG_SIZE {
            let timestamp = Local::now().format("%Y-%m-%d_%H%M%S");
            let rotated_path = log_dir.join(format!("{}_{}.log", LOG_PREFIX, timestamp));
            let _ = fs::rename(&current_path, &rotated_path);

            if let Ok(file) = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&current_path)
            {
                if let Ok(mut log_file) = LOG_FILE.lock() {
                    *log_file = Some(file);
                }
            }

            cleanup_old_logs(&log_dir);
        }
    }
}

fn write_line(log_line: &str) {
    if let Ok(mut log_file) = LOG_FILE.lock() {
        if let Some(ref mut file) = *log_file {
            let _ = file.write_all(log_line.as_bytes());
            let _ = file.flush();
        }
    }

    #[cfg(debug_assertions)]
    eprint!("{}", log_line);

    check_rotation();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line() {
        let line = format_line(log::Level::Warn, "wmr_passthrough::layer", "no camera frame");
        assert!(line.contains("[WARN]"));
        assert!(line.contains("[wmr_passthrough::layer]"));
        assert!(line.ends_with("no camera frame\n"));
    }

    #[test]
    fn test_current_log_path_is_daily() {
        let dir = Path::new("logs");
        let path = get_current_log_path(dir);
        let name = path.file_name().unwrap().to_string_lossy().to_string();

        assert!(name.starts_with("wmr_passthrough_"));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "wmr_passthrough_2024-01-01.log".len());
    }

    #[test]
    fn test_cleanup_keeps_newest_files() {
        let dir = std::env::temp_dir().join(format!("wmr-passthrough-logs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        for i in 0..(MAX_LOG_FILES + 3) {
            fs::write(dir.join(format!("old_{}.log", i)), "x").unwrap();
        }
        fs::write(dir.join("settings.json"), "{}").unwrap();

        cleanup_old_logs(&dir);

        let remaining_logs = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "log").unwrap_or(false))
            .count();
        assert_eq!(remaining_logs, MAX_LOG_FILES);
        assert!(dir.join("settings.json").exists());

        let _ = fs::remove_dir_all(&dir);
    }
}
