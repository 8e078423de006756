use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    error::StoreError,
    process_log::{LogEntry, SharedEntries, lock_entries},
    settings::write_file,
};

pub const SAVE_DELAY: Duration = Duration::from_secs(2);
const MIN_KEPT_ENTRIES: usize = 10;
const MIN_FILE_SIZE_MB: u64 = 1;

/// The JSON file the log ring is persisted to, with its size cap.
#[derive(Debug, Clone)]
pub struct LogFile {
    path: PathBuf,
    max_bytes: u64,
}

impl LogFile {
    pub fn new(path: PathBuf, max_file_size_mb: u64) -> Self {
        Self {
            path,
            max_bytes: max_file_size_mb.max(MIN_FILE_SIZE_MB) * 1024 * 1024,
        }
    }

    #[cfg(test)]
    fn with_max_bytes(path: PathBuf, max_bytes: u64) -> Self {
        Self { path, max_bytes }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    pub fn load(&self) -> Vec<LogEntry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(error) => {
                log::warn!(
                    "[logs] ignoring unreadable log file {}: {error}",
                    self.path.display()
                );
                Vec::new()
            }
        }
    }

    /// Writes `entries` and returns the ones that made it to disk. Older
    /// entries are dropped when the encoded list does not fit the cap.
    pub fn save(&self, entries: &[LogEntry]) -> Result<Vec<LogEntry>, StoreError> {
        self.rotate_if_oversized();

        let mut kept = entries.to_vec();
        let mut content = serde_json::to_string(&kept)?;

        if content.len() as u64 > self.max_bytes {
            let target = self.max_bytes * 8 / 10;
            while kept.len() > MIN_KEPT_ENTRIES && content.len() as u64 > target {
                let excess = (kept.len() / 10).max(1);
                kept.drain(..excess);
                content = serde_json::to_string(&kept)?;
            }
            log::info!(
                "[logs] reduced stored log to {} entries to fit {} bytes",
                kept.len(),
                self.max_bytes
            );
        }

        write_file(&self.path, &content)?;
        Ok(kept)
    }

    fn rotate_if_oversized(&self) {
        let Ok(metadata) = fs::metadata(&self.path) else {
            return;
        };
        if metadata.len() <= self.max_bytes {
            return;
        }

        let backup = self.backup_path();
        if backup.exists()
            && let Err(error) = fs::remove_file(&backup)
        {
            log::warn!("[logs] failed to remove old backup {}: {error}", backup.display());
        }
        match fs::rename(&self.path, &backup) {
            Ok(()) => log::info!("[logs] rotated oversized log to {}", backup.display()),
            Err(error) => log::warn!("[logs] failed to rotate log file: {error}"),
        }
    }
}

enum Command {
    Dirty,
    Flush(Sender<()>),
    Shutdown,
}

/// Background worker that persists the shared log ring at most once per
/// [`SAVE_DELAY`] after a change.
pub struct DebouncedLogWriter {
    sender: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DebouncedLogWriter {
    pub fn spawn(file: LogFile, entries: SharedEntries) -> Self {
        Self::spawn_with_delay(file, entries, SAVE_DELAY)
    }

    pub fn spawn_with_delay(file: LogFile, entries: SharedEntries, delay: Duration) -> Self {
        let (sender, receiver) = mpsc::channel::<Command>();

        let worker = std::thread::spawn(move || {
            let mut deadline: Option<Instant> = None;

            loop {
                let command = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        match receiver.recv_timeout(remaining) {
                            Ok(command) => Some(command),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => Some(Command::Shutdown),
                        }
                    }
                    None => Some(receiver.recv().unwrap_or(Command::Shutdown)),
                };

                match command {
                    None => {
                        deadline = None;
                        persist(&file, &entries);
                    }
                    Some(Command::Dirty) => {
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + delay);
                        }
                    }
                    Some(Command::Flush(done)) => {
                        deadline = None;
                        persist(&file, &entries);
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown) => {
                        persist(&file, &entries);
                        log::debug!("[logs] writer stopped");
                        break;
                    }
                }
            }
        });

        Self {
            sender,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn mark_dirty(&self) {
        let _ = self.sender.send(Command::Dirty);
    }

    /// Persists immediately and waits for the write to finish.
    pub fn flush(&self) {
        let (done_sender, done_receiver) = mpsc::channel();
        if self.sender.send(Command::Flush(done_sender)).is_ok() {
            let _ = done_receiver.recv();
        }
    }

    /// Cancels the pending save, writes once more and joins the worker.
    pub fn shutdown(&self) {
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(worker) = worker else {
            return;
        };
        let _ = self.sender.send(Command::Shutdown);
        if worker.join().is_err() {
            log::warn!("[logs] writer thread panicked");
        }
    }
}

fn persist(file: &LogFile, entries: &SharedEntries) {
    let snapshot: Vec<LogEntry> = lock_entries(entries).iter().cloned().collect();

    match file.save(&snapshot) {
        Ok(kept) if kept.len() < snapshot.len() => {
            let dropped: HashSet<_> = snapshot[..snapshot.len() - kept.len()]
                .iter()
                .map(|entry| entry.id)
                .collect();
            lock_entries(entries).retain(|entry| !dropped.contains(&entry.id));
        }
        Ok(_) => {}
        Err(error) => log::warn!("[logs] failed to save logs: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use uuid::Uuid;

    use super::*;
    use crate::process_log::{EngineLog, LogLevel, LogSink, LogSource};

    fn temp_directory() -> PathBuf {
        let directory = std::env::temp_dir().join(format!("v2rayctl-logs-{}", Uuid::new_v4()));
        fs::create_dir_all(&directory).unwrap();
        directory
    }

    fn entries(count: usize) -> Vec<LogEntry> {
        (0..count)
            .map(|index| {
                let message = format!("entry {index} {}", "x".repeat(40));
                LogEntry::new(message, LogLevel::Info, LogSource::App)
            })
            .collect()
    }

    #[test]
    fn oversized_list_is_reduced_from_oldest() {
        let directory = temp_directory();
        let file = LogFile::with_max_bytes(directory.join("logs.json"), 4_000);

        let all = entries(40);
        let kept = file.save(&all).unwrap();

        assert!(kept.len() < all.len());
        assert!(kept.len() >= MIN_KEPT_ENTRIES);
        assert_eq!(kept.last(), all.last());
        assert!(serde_json::to_string(&kept).unwrap().len() <= 3_200);
        assert_eq!(file.load(), kept);

        fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn reduction_keeps_minimum_entries() {
        let directory = temp_directory();
        let file = LogFile::with_max_bytes(directory.join("logs.json"), 10);

        let kept = file.save(&entries(30)).unwrap();
        assert_eq!(kept.len(), MIN_KEPT_ENTRIES);

        fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn oversized_file_is_rotated_to_backup() {
        let directory = temp_directory();
        let path = directory.join("logs.json");
        fs::write(&path, "x".repeat(5_000)).unwrap();

        let file = LogFile::with_max_bytes(path.clone(), 4_000);
        file.save(&entries(2)).unwrap();

        assert_eq!(fs::read_to_string(file.backup_path()).unwrap().len(), 5_000);
        assert_eq!(file.load().len(), 2);

        fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn writer_debounces_until_delay_or_flush() {
        let directory = temp_directory();
        let file = LogFile::new(directory.join("logs.json"), 1);
        let shared = Arc::new(Mutex::new(VecDeque::from(entries(3))));

        let delay = Duration::from_secs(60);
        let writer = DebouncedLogWriter::spawn_with_delay(file.clone(), shared.clone(), delay);
        writer.mark_dirty();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!file.path().exists());

        writer.flush();
        assert_eq!(file.load().len(), 3);

        lock_entries(&shared).push_back(LogEntry::new("late", LogLevel::Info, LogSource::App));
        writer.mark_dirty();
        writer.shutdown();
        writer.shutdown();
        assert_eq!(file.load().len(), 4);

        fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn writer_saves_after_delay() {
        let directory = temp_directory();
        let file = LogFile::new(directory.join("logs.json"), 1);
        let shared = Arc::new(Mutex::new(VecDeque::from(entries(1))));

        let writer =
            DebouncedLogWriter::spawn_with_delay(file.clone(), shared, Duration::from_millis(50));
        writer.mark_dirty();
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(file.load().len(), 1);
        writer.shutdown();

        fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn stored_entries_are_merged_ahead_of_new_ones() {
        let directory = temp_directory();
        let file = LogFile::new(directory.join("logs.json"), 1);
        file.save(&entries(2)).unwrap();

        let sink = EngineLog::persistent(file.clone());
        sink.add_log("fresh", LogLevel::Info, LogSource::App);
        sink.shutdown();

        let stored = file.load();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].message, "fresh");

        fs::remove_dir_all(directory).ok();
    }
}
