//! Message store
//!
//! In-memory index of ingested messages backed by an append-only segment
//! log. Durable messages are written as `"{id}|{json}"` lines and flushed
//! and synced immediately after each write — durability is prioritized
//! over write throughput, a deliberate choice (there is no group commit).
//!
//! Segments rotate at a size threshold and are never deleted. Recovery
//! scans every segment in filename order before the broker starts
//! accepting traffic; malformed lines are skipped and counted, not fatal.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::MessageLogConfig;
use crate::error::{MurmurError, Result};
use crate::message::Message;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";

/// Outcome of a startup recovery scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries successfully restored into the index
    pub recovered: usize,
    /// Malformed lines skipped
    pub failed: usize,
}

struct SegmentWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    len: u64,
}

impl SegmentWriter {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            len,
        })
    }

    fn create_new(dir: &Path) -> Result<Self> {
        Self::open(next_segment_path(dir))
    }

    /// Append one line, then flush and sync. Per-write sync is the
    /// durability contract of the message log.
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.len += line.len() as u64 + 1;
        Ok(())
    }

    fn rotate(&mut self, dir: &Path) -> Result<()> {
        self.writer.flush()?;
        let next = SegmentWriter::create_new(dir)?;
        info!(
            old = %self.path.display(),
            new = %next.path.display(),
            "message segment rotated"
        );
        *self = next;
        Ok(())
    }
}

/// Pick a timestamped segment name that does not collide with an
/// existing file (two rotations within one millisecond bump the stamp).
fn next_segment_path(dir: &Path) -> PathBuf {
    let mut stamp = chrono::Utc::now().timestamp_millis();
    loop {
        let path = dir.join(format!("{}{}{}", SEGMENT_PREFIX, stamp, SEGMENT_SUFFIX));
        if !path.exists() {
            return path;
        }
        stamp += 1;
    }
}

fn segment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Durable/in-memory log of ingested messages, keyed by message id
pub struct MessageStore {
    index: DashMap<u64, Message>,
    writer: Mutex<SegmentWriter>,
    dir: PathBuf,
    max_segment_bytes: u64,
}

/// Shared handle to a [`MessageStore`]
pub type SharedMessageStore = Arc<MessageStore>;

impl MessageStore {
    /// Open the store, creating the persistence directory if needed.
    /// Directory or segment creation failure here aborts broker startup.
    pub fn open(config: &MessageLogConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir).map_err(|e| {
            MurmurError::Persistence(format!(
                "failed to create message log dir {:?}: {}",
                config.dir, e
            ))
        })?;

        // Reuse the newest existing segment so restarts keep appending
        // instead of fragmenting into a new file per boot.
        let writer = match segment_files(&config.dir)?.pop() {
            Some(path) => SegmentWriter::open(path)?,
            None => SegmentWriter::create_new(&config.dir)?,
        };

        Ok(Self {
            index: DashMap::new(),
            writer: Mutex::new(writer),
            dir: config.dir.clone(),
            max_segment_bytes: config.max_segment_bytes,
        })
    }

    /// Restore the in-memory index from every segment file, in filename
    /// order. Single-threaded; runs to completion before the broker
    /// accepts connections. Malformed lines are counted, never fatal.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for path in segment_files(&self.dir)? {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable segment");
                    continue;
                }
            };
            for line in BufReader::new(file).lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "stopping segment scan");
                        report.failed += 1;
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_entry(line) {
                    Some((id, message)) => {
                        self.index.insert(id, message);
                        report.recovered += 1;
                    }
                    None => {
                        warn!(file = %path.display(), "malformed segment line skipped");
                        report.failed += 1;
                    }
                }
            }
        }
        info!(
            recovered = report.recovered,
            failed = report.failed,
            "message store recovery complete"
        );
        Ok(report)
    }

    /// Insert a message into the index and, when durable, append it to the
    /// active segment. Persistence failure is logged and swallowed:
    /// in-memory delivery proceeds, durability is best-effort and not
    /// transactional with delivery.
    pub fn ingest(&self, id: u64, message: Message) {
        let durable = message.durable;
        if durable {
            if let Err(e) = self.append(id, &message) {
                warn!(id, error = %e, "message persistence failed; delivering in-memory only");
            }
        }
        self.index.insert(id, message);
        debug!(id, durable, "message ingested");
    }

    fn append(&self, id: u64, message: &Message) -> Result<()> {
        let line = format!("{}|{}", id, serde_json::to_string(message)?);
        let mut writer = self.writer.lock();
        if writer.len >= self.max_segment_bytes {
            writer.rotate(&self.dir)?;
        }
        writer.write_line(&line)
    }

    /// Fetch a message by id
    pub fn get(&self, id: u64) -> Option<Message> {
        self.index.get(&id).map(|entry| entry.value().clone())
    }

    /// Whether the store holds the given id
    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of messages in the index
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All messages on `topic` with id greater than `after`, in id order.
    /// Used by subscribe-time catch-up replays.
    pub fn topic_messages_after(&self, topic: &str, after: u64) -> Vec<(u64, Message)> {
        let mut out: Vec<(u64, Message)> = self
            .index
            .iter()
            .filter(|entry| *entry.key() > after && entry.value().topic == topic)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

fn parse_entry(line: &str) -> Option<(u64, Message)> {
    let (id, json) = line.split_once('|')?;
    let id: u64 = id.parse().ok()?;
    let message: Message = serde_json::from_str(json).ok()?;
    Some((id, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessageLogConfig;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> MessageStore {
        store_with_limit(dir, 10 * 1024 * 1024)
    }

    fn store_with_limit(dir: &TempDir, max_segment_bytes: u64) -> MessageStore {
        MessageStore::open(&MessageLogConfig {
            dir: dir.path().to_path_buf(),
            max_segment_bytes,
        })
        .unwrap()
    }

    #[test]
    fn ingest_and_get() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ingest(1, Message::durable("orders", "a"));
        assert_eq!(store.get(1).unwrap().payload, "a");
        assert!(store.get(2).is_none());
    }

    #[test]
    fn recovery_restores_exact_index() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_in(&dir);
            for id in 1..=20u64 {
                store.ingest(id, Message::durable("orders", format!("m{}", id)));
            }
        }
        let store = store_in(&dir);
        assert!(store.is_empty());
        let report = store.recover().unwrap();
        assert_eq!(report.recovered, 20);
        assert_eq!(report.failed, 0);
        for id in 1..=20u64 {
            assert_eq!(store.get(id).unwrap().payload, format!("m{}", id));
        }
    }

    #[test]
    fn transient_messages_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_in(&dir);
            store.ingest(1, Message::durable("t", "keep"));
            store.ingest(2, Message::transient("t", "drop"));
        }
        let store = store_in(&dir);
        store.recover().unwrap();
        assert!(store.contains(1));
        assert!(!store.contains(2));
    }

    #[test]
    fn malformed_lines_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_in(&dir);
            store.ingest(1, Message::durable("t", "good"));
        }
        // Corrupt the segment with lines that should be skipped
        let seg = segment_files(dir.path()).unwrap().pop().unwrap();
        let mut contents = fs::read_to_string(&seg).unwrap();
        contents.push_str("no-pipe-here\n");
        contents.push_str("notanumber|{\"topic\":\"t\",\"payload\":\"x\"}\n");
        contents.push_str("2|{broken json\n");
        fs::write(&seg, contents).unwrap();

        let store = store_in(&dir);
        let report = store.recover().unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 3);
        assert!(store.contains(1));
    }

    #[test]
    fn rotation_creates_new_segment_and_keeps_old() {
        let dir = TempDir::new().unwrap();
        let store = store_with_limit(&dir, 64);
        for id in 1..=10u64 {
            store.ingest(
                id,
                Message::durable("orders", "payload long enough to trip rotation"),
            );
        }
        let segments = segment_files(dir.path()).unwrap();
        assert!(segments.len() > 1, "expected rotation, got {:?}", segments);

        // Everything is still recoverable across segments
        let fresh = store_with_limit(&dir, 64);
        let report = fresh.recover().unwrap();
        assert_eq!(report.recovered, 10);
    }

    #[test]
    fn topic_scan_is_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ingest(5, Message::durable("orders", "e"));
        store.ingest(3, Message::durable("orders", "c"));
        store.ingest(4, Message::durable("billing", "d"));
        store.ingest(9, Message::durable("orders", "i"));

        let hits = store.topic_messages_after("orders", 3);
        let ids: Vec<u64> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![5, 9]);
    }

    #[test]
    fn restart_reuses_newest_segment() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_in(&dir);
            store.ingest(1, Message::durable("t", "a"));
        }
        {
            let store = store_in(&dir);
            store.recover().unwrap();
            store.ingest(2, Message::durable("t", "b"));
        }
        assert_eq!(segment_files(dir.path()).unwrap().len(), 1);
    }
}
