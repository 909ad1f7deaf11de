use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tracing_subscriber::fmt::MakeWriter;

/// Debug log kept next to the run journals.
pub const DEBUG_LOG: &str = "esxctl.log";

/// Records held before the command is known to mutate the fleet.
const EARLY_LIMIT: usize = 64 * 1024;

// ── DebugLog ─────────────────────────────────────────────

enum Sink {
    /// Command not dispatched yet; keep what config loading logged.
    Early(Vec<u8>),
    /// Destination chosen, file not opened until the next record.
    Pending { path: PathBuf, early: Vec<u8> },
    Open(File),
    Off,
}

/// `MakeWriter` for the per-config debug log.
///
/// The subscriber is installed before the config is read, so the data
/// directory is not known yet. Records are buffered until
/// [`DebugLogHandle::record_to`] names the logs directory (mutating
/// commands) or [`DebugLogHandle::discard`] drops them (everything else).
#[derive(Clone)]
pub struct DebugLog {
    sink: Arc<Mutex<Sink>>,
}

#[derive(Clone)]
pub struct DebugLogHandle {
    sink: Arc<Mutex<Sink>>,
}

fn lock(sink: &Mutex<Sink>) -> MutexGuard<'_, Sink> {
    sink.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DebugLog {
    pub fn new() -> (Self, DebugLogHandle) {
        let sink = Arc::new(Mutex::new(Sink::Early(Vec::new())));
        (Self { sink: sink.clone() }, DebugLogHandle { sink })
    }
}

impl DebugLogHandle {
    /// Send records to `<logs_dir>/esxctl.log`, early ones first.
    pub fn record_to(&self, logs_dir: &Path) {
        let mut sink = lock(&self.sink);
        let early = match std::mem::replace(&mut *sink, Sink::Off) {
            Sink::Early(early) | Sink::Pending { early, .. } => early,
            Sink::Open(_) | Sink::Off => Vec::new(),
        };
        *sink = Sink::Pending {
            path: logs_dir.join(DEBUG_LOG),
            early,
        };
    }

    pub fn discard(&self) {
        *lock(&self.sink) = Sink::Off;
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct DebugLogWriter {
    sink: Arc<Mutex<Sink>>,
}

impl Write for DebugLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut sink = lock(&self.sink);
        if let Sink::Pending { path, early } = &mut *sink {
            let opened = open_append(path).and_then(|mut file| {
                file.write_all(early)?;
                Ok(file)
            });
            // A log that cannot be opened must not fail the run.
            *sink = opened.map(Sink::Open).unwrap_or(Sink::Off);
        }
        match &mut *sink {
            Sink::Early(early) => {
                if early.len() + buf.len() <= EARLY_LIMIT {
                    early.extend_from_slice(buf);
                }
                Ok(buf.len())
            }
            Sink::Open(file) => file.write(buf),
            Sink::Pending { .. } | Sink::Off => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut *lock(&self.sink) {
            Sink::Open(file) => file.flush(),
            _ => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DebugLog {
    type Writer = DebugLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DebugLogWriter {
            sink: self.sink.clone(),
        }
    }
}

// ── RunJournal ───────────────────────────────────────────

/// Record of one mutating invocation (`apply`, `destroy`, `power`).
///
/// Created as `<timestamp>_<command>_running.log`; `finish` renames it to
/// `_ok.log` or `_failed.log` so interrupted runs stay visible.
pub struct RunJournal {
    file: File,
    path: PathBuf,
}

impl RunJournal {
    pub fn new(logs_dir: &Path, command: &str) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let ts = utc_timestamp();
        let path = logs_dir.join(format!("{ts}_{command}_running.log"));
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    pub fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
    }

    pub fn finish(self, success: bool) -> PathBuf {
        let suffix = if success { "ok" } else { "failed" };
        let renamed = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| f.replace("_running.log", &format!("_{suffix}.log")));
        match renamed {
            Some(name) => {
                let new_path = self.path.with_file_name(name);
                match fs::rename(&self.path, &new_path) {
                    Ok(()) => new_path,
                    Err(_) => self.path,
                }
            }
            None => self.path,
        }
    }
}

// ── Rotation ─────────────────────────────────────────────

/// Delete the oldest finished journals for `command`, keeping at most `keep`.
pub fn rotate_journals(logs_dir: &Path, command: &str, keep: usize) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };

    let mut matching: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| {
                    f.contains(&format!("_{command}_"))
                        && (f.ends_with("_ok.log") || f.ends_with("_failed.log"))
                })
        })
        .collect();

    // Timestamp prefix sorts chronologically.
    matching.sort();

    if matching.len() > keep {
        for old in &matching[..matching.len() - keep] {
            let _ = fs::remove_file(old);
        }
    }
}

// ── Listing ──────────────────────────────────────────────

pub struct JournalEntry {
    pub path: PathBuf,
    pub timestamp: String,
    pub command: String,
    pub status: String,
}

/// Finished journals, oldest first.
pub fn list_journals(logs_dir: &Path) -> Vec<JournalEntry> {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return Vec::new();
    };

    let mut logs: Vec<JournalEntry> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let fname = path.file_name()?.to_str()?;
            if fname.ends_with("_running.log") {
                return None;
            }
            // <timestamp>_<command>_<status>.log
            let stem = fname.strip_suffix(".log")?;
            let first = stem.find('_')?;
            let last = stem.rfind('_')?;
            if first == last {
                return None;
            }
            Some(JournalEntry {
                timestamp: stem[..first].to_string(),
                command: stem[first + 1..last].to_string(),
                status: stem[last + 1..].to_string(),
                path: path.clone(),
            })
        })
        .collect();

    logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    logs
}

/// The newest journal, optionally only among failed runs.
pub fn latest_journal(logs_dir: &Path, failed_only: bool) -> Option<PathBuf> {
    list_journals(logs_dir)
        .into_iter()
        .rev()
        .find(|e| !failed_only || e.status == "failed")
        .map(|e| e.path)
}

// ── Timestamp helper ─────────────────────────────────────

/// Format the current UTC time as `YYYY-MM-DDTHH-MM-SS` without any
/// external datetime dependency.
pub fn utc_timestamp() -> String {
    let dur = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();

    // Civil date from unix timestamp
    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // Algorithm from Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}-{minutes:02}-{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    fn log_line(log: &DebugLog, line: &str) {
        writeln!(log.make_writer(), "{line}").unwrap();
    }

    #[test]
    fn debug_log_keeps_early_records_and_opens_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("cfg/logs");
        let (log, handle) = DebugLog::new();

        log_line(&log, "config loaded");
        handle.record_to(&logs_dir);
        assert!(!logs_dir.exists());

        log_line(&log, "probing esx1");
        let text = fs::read_to_string(logs_dir.join(DEBUG_LOG)).unwrap();
        assert_eq!(text, "config loaded\nprobing esx1\n");
    }

    #[test]
    fn discarded_debug_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (log, handle) = DebugLog::new();
        log_line(&log, "config loaded");
        handle.discard();
        log_line(&log, "status");
        handle.record_to(dir.path());
        log_line(&log, "late");
        let text = fs::read_to_string(dir.path().join(DEBUG_LOG)).unwrap();
        assert_eq!(text, "late\n");
    }

    #[test]
    fn journal_is_renamed_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = RunJournal::new(dir.path(), "apply").unwrap();
        journal.write_line("create esx1/web1: applied");
        let path = journal.finish(false);
        assert!(path.to_string_lossy().ends_with("_apply_failed.log"));
        assert!(fs::read_to_string(&path).unwrap().contains("web1"));
        assert_eq!(latest_journal(dir.path(), true), Some(path));
    }

    #[test]
    fn listing_skips_running_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "2026-01-02T10-00-00_apply_ok.log");
        touch(dir.path(), "2026-01-01T10-00-00_destroy_failed.log");
        touch(dir.path(), "2026-01-03T10-00-00_apply_running.log");
        touch(dir.path(), "notes.txt");

        let logs = list_journals(dir.path());
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].command, "destroy");
        assert_eq!(logs[0].status, "failed");
        assert_eq!(logs[1].timestamp, "2026-01-02T10-00-00");
        assert_eq!(
            latest_journal(dir.path(), false).unwrap().file_name().unwrap(),
            "2026-01-02T10-00-00_apply_ok.log"
        );
    }

    #[test]
    fn rotation_keeps_newest_per_command() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=4 {
            touch(dir.path(), &format!("2026-01-0{day}T00-00-00_apply_ok.log"));
        }
        touch(dir.path(), "2026-01-01T00-00-00_destroy_ok.log");

        rotate_journals(dir.path(), "apply", 2);
        let left: Vec<String> = list_journals(dir.path())
            .into_iter()
            .map(|e| format!("{}_{}", e.timestamp, e.command))
            .collect();
        assert_eq!(
            left,
            vec![
                "2026-01-01T00-00-00_destroy",
                "2026-01-03T00-00-00_apply",
                "2026-01-04T00-00-00_apply",
            ]
        );
    }

    #[test]
    fn timestamp_shape() {
        let ts = utc_timestamp();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[10..11], "T");
        assert!(!ts.contains(':'));
    }
}
