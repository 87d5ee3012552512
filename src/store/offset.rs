//! Offset store
//!
//! Durable per-(group, topic) consumption cursors. Each consumer group
//! gets its own append-only file (`"{group}-offset.log"`) of lines
//! `"{group}:{topic}|{messageId}"`; on recovery the last matching line in
//! file order wins.
//!
//! Unlike the message log, offset writes are buffered and flushed on a
//! periodic timer — a bounded durability window traded for write
//! throughput. An in-memory last-known-value cache suppresses writes that
//! would repeat the current value.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::OffsetLogConfig;
use crate::error::{MurmurError, Result};

const OFFSET_MARKER: &str = "-offset";
const OFFSET_SUFFIX: &str = ".log";

struct GroupLog {
    writer: BufWriter<File>,
    path: PathBuf,
    len: u64,
}

impl GroupLog {
    fn open(dir: &Path, group_id: &str) -> Result<Self> {
        let path = active_path(dir, group_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            len,
        })
    }

    /// Buffered append; durability comes from the periodic flush.
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.len += line.len() as u64 + 1;
        Ok(())
    }

    /// Rename the full file aside with a timestamp suffix and start a
    /// fresh one. The caller's value cache is intentionally NOT cleared:
    /// message ids are globally increasing, so stale cached values remain
    /// valid lower bounds.
    fn rotate(&mut self, dir: &Path, group_id: &str) -> Result<()> {
        self.writer.flush()?;
        let rotated = rotated_path(dir, group_id);
        fs::rename(&self.path, &rotated)?;
        info!(
            group = group_id,
            rotated = %rotated.display(),
            "offset file rotated"
        );
        *self = GroupLog::open(dir, group_id)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn active_path(dir: &Path, group_id: &str) -> PathBuf {
    dir.join(format!("{}{}{}", group_id, OFFSET_MARKER, OFFSET_SUFFIX))
}

fn rotated_path(dir: &Path, group_id: &str) -> PathBuf {
    let mut stamp = chrono::Utc::now().timestamp_millis();
    loop {
        let path = dir.join(format!(
            "{}{}-{}{}",
            group_id, OFFSET_MARKER, stamp, OFFSET_SUFFIX
        ));
        if !path.exists() {
            return path;
        }
        stamp += 1;
    }
}

/// All offset files in the directory, sorted by filename. Rotated files
/// (`g-offset-{ts}.log`) sort before the active file (`g-offset.log`), so
/// a sequential scan naturally ends on the newest data.
fn offset_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.contains(OFFSET_MARKER) && name.ends_with(OFFSET_SUFFIX) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn group_files(dir: &Path, group_id: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{}{}", group_id, OFFSET_MARKER);
    Ok(offset_files(dir)?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect())
}

fn parse_line(line: &str) -> Option<(&str, &str, u64)> {
    let (key, offset) = line.split_once('|')?;
    let (group, topic) = key.split_once(':')?;
    let offset: u64 = offset.parse().ok()?;
    Some((group, topic, offset))
}

/// Durable per-(group, topic) cursor store
pub struct OffsetStore {
    dir: PathBuf,
    max_file_bytes: u64,
    /// Last value written per (group, topic); equal writes are suppressed
    cache: DashMap<(String, String), u64>,
    writers: DashMap<String, Mutex<GroupLog>>,
}

/// Shared handle to an [`OffsetStore`]
pub type SharedOffsetStore = Arc<OffsetStore>;

impl OffsetStore {
    /// Open the store, creating the persistence directory if needed.
    /// Directory creation failure here aborts broker startup.
    pub fn open(config: &OffsetLogConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir).map_err(|e| {
            MurmurError::Persistence(format!(
                "failed to create offset log dir {:?}: {}",
                config.dir, e
            ))
        })?;
        Ok(Self {
            dir: config.dir.clone(),
            max_file_bytes: config.max_file_bytes,
            cache: DashMap::new(),
            writers: DashMap::new(),
        })
    }

    /// Record the latest offset for (group, topic). Writes behind or equal
    /// to the cached last-written value are skipped entirely: ids are
    /// globally increasing, so a lower value is always stale, and letting
    /// it through would regress the last-matching-line-wins recovery. The
    /// cache entry is held across the append so concurrent records for the
    /// same key land in the file in id order.
    pub fn record(&self, group_id: &str, topic: &str, message_id: u64) -> Result<()> {
        let key = (group_id.to_string(), topic.to_string());
        let mut cached = self.cache.entry(key).or_default();
        if *cached >= message_id {
            debug!(group = group_id, topic, message_id, "offset not ahead, write skipped");
            return Ok(());
        }

        let entry = match self.writers.entry(group_id.to_string()) {
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(v) => v.insert(Mutex::new(GroupLog::open(&self.dir, group_id)?)),
        };
        let mut log = entry.lock();
        if log.len >= self.max_file_bytes {
            log.rotate(&self.dir, group_id)?;
        }
        log.write_line(&format!("{}:{}|{}", group_id, topic, message_id))?;
        drop(log);

        *cached = message_id;
        debug!(group = group_id, topic, message_id, "offset recorded");
        Ok(())
    }

    /// Flush every open group writer to disk
    pub fn flush_all(&self) -> Result<()> {
        for entry in self.writers.iter() {
            entry.value().lock().flush()?;
        }
        Ok(())
    }

    /// Spawn the periodic flush task
    pub fn spawn_flush_task(
        store: SharedOffsetStore,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush_all() {
                    warn!(error = %e, "offset flush failed");
                }
            }
        })
    }

    /// Recover the stored offset for one (group, topic), if any. Scans
    /// that group's files sequentially; the last matching line wins. The
    /// group's writer is flushed first so buffered records are visible.
    pub fn recover_one(&self, group_id: &str, topic: &str) -> Result<Option<u64>> {
        if let Some(writer) = self.writers.get(group_id) {
            writer.lock().flush()?;
        }
        let mut latest = None;
        for path in group_files(&self.dir, group_id)? {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable offset file");
                    continue;
                }
            };
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Some((g, t, offset)) if g == group_id && t == topic => {
                        latest = Some(offset);
                    }
                    Some(_) => {}
                    None => warn!(file = %path.display(), "malformed offset line skipped"),
                }
            }
        }
        if let Some(offset) = latest {
            self.raise_cache(group_id, topic, offset);
        }
        Ok(latest)
    }

    /// Warm the cache with a recovered value without ever lowering it; a
    /// concurrent record may already have written something newer.
    fn raise_cache(&self, group_id: &str, topic: &str, offset: u64) {
        self.cache
            .entry((group_id.to_string(), topic.to_string()))
            .and_modify(|current| {
                if offset > *current {
                    *current = offset;
                }
            })
            .or_insert(offset);
    }

    /// Recover every group's offsets in one pass over all offset files.
    /// Used for cold-start bulk restore without prior knowledge of which
    /// groups existed.
    pub fn recover_all(&self) -> Result<HashMap<String, HashMap<String, u64>>> {
        self.flush_all()?;
        let mut result: HashMap<String, HashMap<String, u64>> = HashMap::new();
        for path in offset_files(&self.dir)? {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable offset file");
                    continue;
                }
            };
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Some((group, topic, offset)) => {
                        result
                            .entry(group.to_string())
                            .or_default()
                            .insert(topic.to_string(), offset);
                        self.raise_cache(group, topic, offset);
                    }
                    None => warn!(file = %path.display(), "malformed offset line skipped"),
                }
            }
        }
        info!(groups = result.len(), "offset store bulk recovery complete");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> OffsetStore {
        store_with_limit(dir, 10 * 1024 * 1024)
    }

    fn store_with_limit(dir: &TempDir, max_file_bytes: u64) -> OffsetStore {
        OffsetStore::open(&OffsetLogConfig {
            dir: dir.path().to_path_buf(),
            max_file_bytes,
            flush_interval_ms: 1_000,
        })
        .unwrap()
    }

    fn line_count(path: &Path) -> usize {
        fs::read_to_string(path).unwrap().lines().count()
    }

    #[test]
    fn record_flush_recover() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.record("G1", "orders", 100).unwrap();
        store.flush_all().unwrap();

        let fresh = store_in(&dir);
        assert_eq!(fresh.recover_one("G1", "orders").unwrap(), Some(100));
        assert_eq!(fresh.recover_one("G1", "billing").unwrap(), None);
        assert_eq!(fresh.recover_one("G2", "orders").unwrap(), None);
    }

    #[test]
    fn last_matching_line_wins() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.record("G1", "orders", 5).unwrap();
        store.record("G1", "orders", 7).unwrap();
        store.record("G1", "orders", 9).unwrap();
        store.flush_all().unwrap();

        let fresh = store_in(&dir);
        assert_eq!(fresh.recover_one("G1", "orders").unwrap(), Some(9));
    }

    #[test]
    fn out_of_order_writes_cannot_regress_the_durable_offset() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        // Acks racing out of order: the durable write for 10 lands first,
        // the late write for 9 must be dropped, not appended after it.
        store.record("G1", "orders", 10).unwrap();
        store.record("G1", "orders", 9).unwrap();
        store.flush_all().unwrap();

        assert_eq!(line_count(&active_path(dir.path(), "G1")), 1);

        let fresh = store_in(&dir);
        assert_eq!(fresh.recover_one("G1", "orders").unwrap(), Some(10));
    }

    #[test]
    fn recover_one_sees_buffered_records() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.record("G1", "orders", 7).unwrap();
        // No flush: recovery on the live store must still see the record
        // and must not lower the cache below it.
        assert_eq!(store.recover_one("G1", "orders").unwrap(), Some(7));
        store.record("G1", "orders", 6).unwrap();
        store.flush_all().unwrap();
        assert_eq!(line_count(&active_path(dir.path(), "G1")), 1);
    }

    #[test]
    fn equal_value_writes_are_suppressed() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.record("G1", "orders", 5).unwrap();
        store.record("G1", "orders", 5).unwrap();
        store.record("G1", "orders", 5).unwrap();
        store.flush_all().unwrap();

        assert_eq!(line_count(&active_path(dir.path(), "G1")), 1);
    }

    #[test]
    fn one_file_per_group() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.record("G1", "orders", 1).unwrap();
        store.record("G2", "orders", 2).unwrap();
        store.flush_all().unwrap();

        assert!(active_path(dir.path(), "G1").exists());
        assert!(active_path(dir.path(), "G2").exists());
    }

    #[test]
    fn rotation_keeps_cache_and_history() {
        let dir = TempDir::new().unwrap();
        let store = store_with_limit(&dir, 24);
        store.record("G1", "orders", 1).unwrap();
        store.record("G1", "orders", 2).unwrap();
        store.record("G1", "orders", 3).unwrap();
        store.flush_all().unwrap();

        let files = group_files(dir.path(), "G1").unwrap();
        assert!(files.len() > 1, "expected rotation, got {:?}", files);

        // Cache survived rotation: a repeat of the latest value is still
        // suppressed even though the active file is fresh.
        store.record("G1", "orders", 3).unwrap();
        store.flush_all().unwrap();

        // Recovery walks rotated files then the active one.
        let fresh = store_with_limit(&dir, 24);
        assert_eq!(fresh.recover_one("G1", "orders").unwrap(), Some(3));
    }

    #[test]
    fn recover_all_spans_groups_and_topics() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.record("G1", "orders", 10).unwrap();
        store.record("G1", "billing", 20).unwrap();
        store.record("G2", "orders", 30).unwrap();
        store.record("G1", "orders", 15).unwrap();
        store.flush_all().unwrap();

        let fresh = store_in(&dir);
        let all = fresh.recover_all().unwrap();
        assert_eq!(all["G1"]["orders"], 15);
        assert_eq!(all["G1"]["billing"], 20);
        assert_eq!(all["G2"]["orders"], 30);
    }

    #[test]
    fn recover_all_on_empty_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.recover_all().unwrap().is_empty());
    }

    #[test]
    fn malformed_offset_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.record("G1", "orders", 4).unwrap();
        store.flush_all().unwrap();

        let path = active_path(dir.path(), "G1");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("garbage line\n");
        contents.push_str("G1:orders|notanumber\n");
        fs::write(&path, contents).unwrap();

        let fresh = store_in(&dir);
        assert_eq!(fresh.recover_one("G1", "orders").unwrap(), Some(4));
    }
}
