use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::{
    fs,
    io::{AsyncBufReadExt, BufReader},
    time::{sleep, Duration},
};

use crate::config::AppConfig;
use crate::store::Namespace;
use crate::upload::DumpSink;

/// Immediate delivery attempts made synchronously inside `submit` before the
/// dump is handed to the persisted queue.
const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_RETRY_PAUSE: Duration = Duration::from_millis(500);

const ENTRY_EXT: &str = "tsv";

/// Persisted uploader settings. The identifier counter is written back before
/// an id is handed out, so a restart can skip an id but never reuse one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderState {
    pub receiver_url: String,
    pub next_id: u32,
}

impl Default for UploaderState {
    fn default() -> Self {
        Self {
            receiver_url: String::new(),
            next_id: 1,
        }
    }
}

/// Status record for the most recent dump, kept for the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DumpRecord {
    pub id: u32,
    pub timestamp: String,
    pub preview: String,
    pub size: usize,
    pub uploaded: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct UploadStats {
    pub total_success: u64,
    pub total_failed: u64,
    pub queue_depth: usize,
    pub last_upload_time: String,
    pub receiver_url: String,
}

enum EntryBody {
    File(PathBuf),
    /// Fallback when the queue directory is unavailable; lost on restart.
    Memory(Vec<u8>),
}

struct QueueEntry {
    timestamp: String,
    body: EntryBody,
}

/// Order-preserving persistent upload queue.
///
/// Each queued dump lives in its own `<id>.tsv` file: a metadata line followed
/// by the raw payload. Ordering truth is the in-memory index keyed by id,
/// rebuilt by enumerating the directory at startup and after storage errors,
/// and kept in lockstep with every insert and remove in between.
pub struct UploadQueue<S> {
    sink: S,
    device_name: String,
    dir: Option<PathBuf>,
    index: BTreeMap<u32, QueueEntry>,
    state: Namespace<UploaderState>,
    stats: UploadStats,
    last_dump: Option<DumpRecord>,
    preview_lines: usize,
    max_entries: usize,
    retry_base_ms: u64,
    retry_cap_ms: u64,
    retry_interval_ms: u64,
    next_retry_due_ms: u64,
    consecutive_failures: u32,
}

impl<S: DumpSink> UploadQueue<S> {
    pub async fn open(config: &AppConfig, sink: S) -> Self {
        let state: Namespace<UploaderState> =
            Namespace::open(&config.state_directory, "uploader").await;

        let dir = PathBuf::from(&config.queue_directory);
        let dir = match fs::create_dir_all(&dir).await {
            Ok(()) => Some(dir),
            Err(err) => {
                tracing::error!(
                    dir = %dir.display(),
                    error = %err,
                    "queue directory unavailable, queued dumps will not survive restart"
                );
                None
            }
        };

        let mut queue = Self {
            sink,
            device_name: config.device_name.clone(),
            dir,
            index: BTreeMap::new(),
            stats: UploadStats {
                receiver_url: state.get().receiver_url.clone(),
                ..UploadStats::default()
            },
            state,
            last_dump: None,
            preview_lines: config.preview_lines,
            max_entries: config.max_queued_dumps,
            retry_base_ms: config.retry_base_ms,
            retry_cap_ms: config.retry_cap_ms,
            retry_interval_ms: config.retry_base_ms,
            next_retry_due_ms: 0,
            consecutive_failures: 0,
        };
        queue.rescan().await;

        tracing::info!(pending = queue.stats.queue_depth, "upload queue ready");
        if queue.stats.receiver_url.is_empty() {
            tracing::info!("no receiver url configured, dumps will queue until one is set");
        } else {
            tracing::info!(url = %queue.stats.receiver_url, "receiver configured");
        }
        queue
    }

    /// Rebuilds the index by enumerating the queue directory. Called at
    /// startup and whenever a storage error may have invalidated the index.
    pub async fn rescan(&mut self) {
        self.index.retain(|_, entry| matches!(entry.body, EntryBody::Memory(_)));

        if let Some(dir) = self.dir.clone() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(err) => {
                    tracing::error!(dir = %dir.display(), error = %err, "queue scan failed");
                    self.stats.queue_depth = self.index.len();
                    return;
                }
            };
            while let Ok(Some(ent)) = entries.next_entry().await {
                let path = ent.path();
                if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                    continue;
                }
                let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u32>().ok())
                else {
                    continue;
                };
                let timestamp = read_meta_timestamp(&path)
                    .await
                    .unwrap_or_else(|| "unknown".to_string());
                self.index.insert(
                    id,
                    QueueEntry {
                        timestamp,
                        body: EntryBody::File(path),
                    },
                );
            }
        }

        self.stats.queue_depth = self.index.len();
    }

    /// Accepts a captured dump. Assigns and persists the next identifier,
    /// attempts immediate delivery when a receiver is configured, and queues
    /// the dump on failure. Never fails observably to the caller.
    pub async fn submit(&mut self, data: &[u8], timestamp: &str) -> DumpRecord {
        let id = self.state.get().next_id;
        let mut persisted = self.state.get().clone();
        persisted.next_id = id + 1;
        self.state.save(persisted).await;

        let mut record = DumpRecord {
            id,
            timestamp: timestamp.to_string(),
            preview: extract_preview(data, self.preview_lines),
            size: data.len(),
            uploaded: false,
        };

        let url = self.state.get().receiver_url.clone();
        if url.is_empty() {
            tracing::info!(id, bytes = data.len(), "no receiver url configured, queuing");
            self.stats.total_failed += 1;
            self.persist_entry(id, timestamp, data).await;
            self.last_dump = Some(record.clone());
            return record;
        }

        let mut uploaded = false;
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self
                .sink
                .deliver(&url, &self.device_name, id, timestamp, data)
                .await
            {
                Ok(()) => {
                    uploaded = true;
                    break;
                }
                Err(err) => {
                    tracing::warn!(id, attempt, error = %err, "immediate upload failed");
                    if attempt < SUBMIT_ATTEMPTS {
                        sleep(SUBMIT_RETRY_PAUSE).await;
                    }
                }
            }
        }

        if uploaded {
            record.uploaded = true;
            self.stats.total_success += 1;
            self.stats.last_upload_time = timestamp.to_string();
            tracing::info!(id, bytes = data.len(), "dump uploaded");
        } else {
            self.stats.total_failed += 1;
            self.persist_entry(id, timestamp, data).await;
            tracing::warn!(id, "dump queued after {SUBMIT_ATTEMPTS} attempts");
        }

        self.last_dump = Some(record.clone());
        record
    }

    /// Background drain step, called once per control-loop tick. Attempts the
    /// oldest queued entry when connectivity is up, a receiver is configured,
    /// and the retry interval has elapsed.
    pub async fn poll(&mut self, now_ms: u64, is_connected: bool) {
        if self.index.is_empty() || !is_connected {
            return;
        }
        let url = self.state.get().receiver_url.clone();
        if url.is_empty() || now_ms < self.next_retry_due_ms {
            return;
        }

        let (&id, entry) = match self.index.iter().next() {
            Some(pair) => pair,
            None => return,
        };
        tracing::info!(
            id,
            pending = self.index.len(),
            interval_ms = self.retry_interval_ms,
            "retrying queued dump"
        );

        let timestamp = entry.timestamp.clone();
        let payload = match &entry.body {
            EntryBody::Memory(bytes) => bytes.clone(),
            EntryBody::File(path) => match read_entry_payload(path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(id, error = %err, "queued entry unreadable, rescanning");
                    let path = path.clone();
                    self.index.remove(&id);
                    let _ = fs::remove_file(&path).await;
                    self.rescan().await;
                    return;
                }
            },
        };

        match self
            .sink
            .deliver(&url, &self.device_name, id, &timestamp, &payload)
            .await
        {
            Ok(()) => {
                if let Some(QueueEntry {
                    body: EntryBody::File(path),
                    ..
                }) = self.index.remove(&id)
                {
                    if let Err(err) = fs::remove_file(&path).await {
                        tracing::error!(id, error = %err, "uploaded entry not removed, rescanning");
                        self.rescan().await;
                    }
                }
                self.stats.total_success += 1;
                self.stats.last_upload_time = timestamp;
                self.stats.queue_depth = self.index.len();
                if let Some(last) = self.last_dump.as_mut() {
                    if last.id == id {
                        last.uploaded = true;
                    }
                }
                self.consecutive_failures = 0;
                self.retry_interval_ms = self.retry_base_ms;
                tracing::info!(id, pending = self.index.len(), "retry succeeded");
            }
            Err(err) => {
                self.consecutive_failures += 1;
                self.retry_interval_ms = backoff_interval(
                    self.retry_base_ms,
                    self.consecutive_failures,
                    self.retry_cap_ms,
                );
                tracing::warn!(
                    id,
                    error = %err,
                    next_try_ms = self.retry_interval_ms,
                    "retry failed"
                );
            }
        }
        self.next_retry_due_ms = now_ms + self.retry_interval_ms;
    }

    /// Persists the destination and resets the backoff so the fresh address is
    /// tried promptly instead of waiting out a stale window.
    pub async fn set_receiver_url(&mut self, url: String) {
        let mut persisted = self.state.get().clone();
        persisted.receiver_url = url.clone();
        self.state.save(persisted).await;
        self.stats.receiver_url = url.clone();
        self.consecutive_failures = 0;
        self.retry_interval_ms = self.retry_base_ms;
        self.next_retry_due_ms = 0;
        tracing::info!(url = %url, "receiver url set");
    }

    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }

    pub fn last_dump(&self) -> Option<&DumpRecord> {
        self.last_dump.as_ref()
    }

    pub fn retry_interval_ms(&self) -> u64 {
        self.retry_interval_ms
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    async fn persist_entry(&mut self, id: u32, timestamp: &str, data: &[u8]) {
        if self.index.len() >= self.max_entries {
            tracing::warn!(id, limit = self.max_entries, "queue full, dropping dump");
            return;
        }

        let body = match &self.dir {
            Some(dir) => {
                let path = dir.join(format!("{id}.{ENTRY_EXT}"));
                match write_entry(&path, id, timestamp, data).await {
                    Ok(()) => EntryBody::File(path),
                    Err(err) => {
                        tracing::error!(id, error = %err, "queue write failed, keeping in memory");
                        EntryBody::Memory(data.to_vec())
                    }
                }
            }
            None => EntryBody::Memory(data.to_vec()),
        };

        self.index.insert(
            id,
            QueueEntry {
                timestamp: timestamp.to_string(),
                body,
            },
        );
        self.stats.queue_depth = self.index.len();
    }
}

/// `min(base * 2^failures, cap)`.
pub fn backoff_interval(base_ms: u64, failures: u32, cap_ms: u64) -> u64 {
    base_ms
        .checked_shl(failures)
        .unwrap_or(cap_ms)
        .min(cap_ms)
}

fn meta_line(id: u32, timestamp: &str, len: usize) -> String {
    format!("# id={id} ts={timestamp} sz={len}\n")
}

async fn write_entry(path: &PathBuf, id: u32, timestamp: &str, data: &[u8]) -> Result<()> {
    let mut contents = meta_line(id, timestamp, data.len()).into_bytes();
    contents.extend_from_slice(data);
    fs::write(path, contents)
        .await
        .with_context(|| format!("write {}", path.display()))
}

/// Reads a queued entry, stripping the metadata line before the payload is
/// replayed to the receiver.
async fn read_entry_payload(path: &PathBuf) -> Result<Vec<u8>> {
    let raw = fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let start = raw
        .iter()
        .position(|&b| b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(raw.len());
    Ok(raw[start..].to_vec())
}

async fn read_meta_timestamp(path: &PathBuf) -> Option<String> {
    let file = fs::File::open(path).await.ok()?;
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line).await.ok()?;
    parse_meta_timestamp(&line)
}

fn parse_meta_timestamp(line: &str) -> Option<String> {
    let idx = line.find("ts=")?;
    let rest = &line[idx + 3..];
    let end = rest.find(' ').unwrap_or(rest.trim_end().len());
    Some(rest[..end].to_string())
}

fn extract_preview(data: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(data);
    text.lines()
        .take(lines)
        .map(|line| line.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n")
}
