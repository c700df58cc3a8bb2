use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Logging capability handed to every component at construction
pub trait Logger: Send + Sync {
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn fault(&self, _context: &str, _msg: &str) {}
    fn connected(&self, _peer: &SocketAddr) {}
    fn disconnected(&self, _peer: &SocketAddr) {}
    fn received(&self, _path: &Path, _bytes: u64) {}
    fn deleted(&self, _path: &Path) {}
    fn storage_changed(&self, _root: &Path) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

fn stamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

enum Sink {
    Console,
    File {
        dir: PathBuf,
        prefix: String,
        file: Mutex<(NaiveDate, File)>,
    },
}

/// Line-oriented logger. Writes `[timestamp] LEVEL message` either to stderr
/// or to `<dir>/<prefix>YYYYMMDD.log`, opening a new file when the local date
/// changes.
pub struct TextLogger {
    sink: Sink,
}

impl TextLogger {
    pub fn console() -> Self {
        Self { sink: Sink::Console }
    }

    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create log directory {}", dir.display()))?;
        let today = Local::now().date_naive();
        let f = Self::open(&dir, prefix, today)?;
        Ok(Self {
            sink: Sink::File {
                dir,
                prefix: prefix.to_string(),
                file: Mutex::new((today, f)),
            },
        })
    }

    fn open(dir: &Path, prefix: &str, date: NaiveDate) -> Result<File> {
        let path = dir.join(format!("{prefix}{}.log", date.format("%Y%m%d")));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log file {}", path.display()))
    }

    /// Path of the file currently written, `None` for the console sink
    pub fn current_path(&self) -> Option<PathBuf> {
        match &self.sink {
            Sink::Console => None,
            Sink::File { dir, prefix, file } => {
                let date = match file.lock() {
                    Ok(g) => g.0,
                    Err(_) => Local::now().date_naive(),
                };
                Some(dir.join(format!("{prefix}{}.log", date.format("%Y%m%d"))))
            }
        }
    }

    fn line(&self, level: &str, s: &str) {
        match &self.sink {
            Sink::Console => eprintln!("[{}] {level} {s}", stamp()),
            Sink::File { dir, prefix, file } => {
                if let Ok(mut g) = file.lock() {
                    let today = Local::now().date_naive();
                    if g.0 != today {
                        if let Ok(f) = Self::open(dir, prefix, today) {
                            *g = (today, f);
                        }
                    }
                    let _ = writeln!(g.1, "[{}] {level} {s}", stamp());
                }
            }
        }
    }
}

impl Logger for TextLogger {
    fn info(&self, msg: &str) {
        self.line("INFO", msg);
    }
    fn warn(&self, msg: &str) {
        self.line("WARN", msg);
    }
    fn fault(&self, context: &str, msg: &str) {
        if context.is_empty() {
            self.line("FAULT", msg);
        } else {
            self.line("FAULT", &format!("{context}: {msg}"));
        }
    }
    fn connected(&self, peer: &SocketAddr) {
        self.line("INFO", &format!("CONNECT peer={peer}"));
    }
    fn disconnected(&self, peer: &SocketAddr) {
        self.line("INFO", &format!("CLOSE peer={peer}"));
    }
    fn received(&self, path: &Path, bytes: u64) {
        self.line("INFO", &format!("RECEIVED path={} bytes={bytes}", path.display()));
    }
    fn deleted(&self, path: &Path) {
        self.line("INFO", &format!("DELETE path={}", path.display()));
    }
    fn storage_changed(&self, root: &Path) {
        self.line("INFO", &format!("STORAGE root={}", root.display()));
    }
}

/// Keeps lines in memory; used by tests to assert on what was logged
#[derive(Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    fn push(&self, s: String) {
        if let Ok(mut g) = self.lines.lock() {
            g.push(s);
        }
    }
}

impl Logger for MemoryLogger {
    fn info(&self, msg: &str) {
        self.push(format!("INFO {msg}"));
    }
    fn warn(&self, msg: &str) {
        self.push(format!("WARN {msg}"));
    }
    fn fault(&self, context: &str, msg: &str) {
        self.push(format!("FAULT {context}: {msg}"));
    }
    fn connected(&self, peer: &SocketAddr) {
        self.push(format!("CONNECT {peer}"));
    }
    fn disconnected(&self, peer: &SocketAddr) {
        self.push(format!("CLOSE {peer}"));
    }
    fn received(&self, path: &Path, bytes: u64) {
        self.push(format!("RECEIVED {} {bytes}", path.display()));
    }
    fn deleted(&self, path: &Path) {
        self.push(format!("DELETE {}", path.display()));
    }
    fn storage_changed(&self, root: &Path) {
        self.push(format!("STORAGE {}", root.display()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = TextLogger::new(dir.path().join("logs"), "ftserver_").unwrap();
        log.info("Daemon goes running");
        log.fault("writer", "failed to create directory</x>");
        log.received(Path::new("/data1/a.fit"), 42);

        let text = std::fs::read_to_string(log.current_path().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("INFO Daemon goes running"));
        assert!(lines[1].contains("FAULT writer: failed to create directory</x>"));
        assert!(lines[2].contains("RECEIVED path=/data1/a.fit bytes=42"));
    }

    #[test]
    fn log_file_name_uses_prefix_and_date() {
        let dir = tempfile::tempdir().unwrap();
        let log = TextLogger::new(dir.path(), "ftserver_").unwrap();
        let name = log.current_path().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ftserver_"));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "ftserver_".len() + 8 + 4);
        assert!(TextLogger::console().current_path().is_none());
    }
}
