use crate::message::{Origin, PipelineMessage};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REGISTRY_VERSION: u32 = 0;
const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(300);
const DEFAULT_TTL_HOURS: i64 = 23;

/// Progress of one source: the highest committed offset or timestamp seen
/// for its identifier, and when it was last touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistryEntry {
    pub offset: i64,
    pub timestamp: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonRegistry {
    version: u32,
    registry: HashMap<String, RegistryEntry>,
}

/// Durable registry of per-source progress. Consumes messages after the
/// sender has written them, remembers the latest position per identifier,
/// and persists the registry to `<run_path>/registry.json` so a restarted
/// agent resumes where it stopped.
#[derive(Clone)]
pub struct Auditor {
    registry: Arc<Mutex<HashMap<String, RegistryEntry>>>,
    registry_path: PathBuf,
    flush_period: Duration,
    cleanup_period: Duration,
    entry_ttl: TimeDelta,
}

impl Auditor {
    pub fn new(run_path: &Path) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            registry_path: run_path.join("registry.json"),
            flush_period: DEFAULT_FLUSH_PERIOD,
            cleanup_period: DEFAULT_CLEANUP_PERIOD,
            entry_ttl: TimeDelta::hours(DEFAULT_TTL_HOURS),
        }
    }

    pub fn with_cleanup_period(mut self, cleanup_period: Duration) -> Self {
        self.cleanup_period = cleanup_period;
        self
    }

    #[cfg(test)]
    fn with_periods(mut self, flush: Duration, cleanup: Duration, ttl: TimeDelta) -> Self {
        self.flush_period = flush;
        self.cleanup_period = cleanup;
        self.entry_ttl = ttl;
        self
    }

    /// Recovers the on-disk registry, purges expired entries, and launches
    /// the consumer loop with its flush and cleanup tickers. The task ends,
    /// after a final flush, when the input channel closes.
    pub fn start(&self, mut input: mpsc::Receiver<PipelineMessage>) -> JoinHandle<()> {
        let recovered = recover_registry(&self.registry_path);
        if let Ok(mut registry) = self.registry.lock() {
            *registry = recovered;
        }
        self.cleanup_registry();

        let auditor = self.clone();
        tokio::spawn(async move {
            let mut flush_ticker = tokio::time::interval(auditor.flush_period);
            let mut cleanup_ticker = tokio::time::interval(auditor.cleanup_period);
            loop {
                tokio::select! {
                    item = input.recv() => match item {
                        Some(PipelineMessage::Log(msg)) => {
                            // An empty identifier means the origin has no
                            // progress to track (network sources).
                            if !msg.origin.identifier.is_empty() {
                                auditor.update_registry(&msg.origin);
                            }
                        }
                        Some(PipelineMessage::Stop) => {
                            debug!("pipeline stopped");
                        }
                        None => break,
                    },
                    _ = flush_ticker.tick() => {
                        if let Err(e) = auditor.flush_registry().await {
                            warn!(error = %e, "could not flush registry");
                        }
                    }
                    _ = cleanup_ticker.tick() => auditor.cleanup_registry(),
                }
            }

            if let Err(e) = auditor.flush_registry().await {
                warn!(error = %e, "could not flush registry on shutdown");
            }
            info!("auditor stopped");
        })
    }

    /// Where to resume reading for this identifier: just past the committed
    /// offset when known, the end of the file for first-seen sources.
    pub fn last_committed_offset(&self, identifier: &str) -> SeekFrom {
        if let Ok(registry) = self.registry.lock() {
            if let Some(entry) = registry.get(identifier) {
                return SeekFrom::Current(entry.offset);
            }
        }
        SeekFrom::End(0)
    }

    /// The committed timestamp for this identifier, empty when unknown.
    pub fn last_committed_timestamp(&self, identifier: &str) -> String {
        if let Ok(registry) = self.registry.lock() {
            if let Some(entry) = registry.get(identifier) {
                return entry.timestamp.clone();
            }
        }
        String::new()
    }

    fn update_registry(&self, origin: &Origin) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.insert(
                origin.identifier.clone(),
                RegistryEntry {
                    offset: origin.offset,
                    timestamp: origin.timestamp.clone(),
                    last_updated: Utc::now(),
                },
            );
        }
    }

    /// Serializes a by-value snapshot taken under the lock, then writes it
    /// to a temporary path and renames over the registry so a crash never
    /// leaves a torn file. The lock is not held across the disk write.
    async fn flush_registry(&self) -> std::io::Result<()> {
        let snapshot = match self.registry.lock() {
            Ok(registry) => registry.clone(),
            Err(_) => return Ok(()),
        };
        let json = JsonRegistry {
            version: REGISTRY_VERSION,
            registry: snapshot,
        };
        let bytes = serde_json::to_vec(&json)?;
        let tmp_path = self.registry_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.registry_path).await
    }

    fn cleanup_registry(&self) {
        let expire_before = Utc::now() - self.entry_ttl;
        if let Ok(mut registry) = self.registry.lock() {
            registry.retain(|_, entry| entry.last_updated >= expire_before);
        }
    }
}

/// Rebuilds the registry from disk. Any read, parse, or version problem
/// yields an empty registry: the agent starts fresh rather than refusing to
/// run.
fn recover_registry(path: &Path) -> HashMap<String, RegistryEntry> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no registry recovered");
            return HashMap::new();
        }
    };
    match serde_json::from_slice::<JsonRegistry>(&bytes) {
        Ok(json) if json.version == REGISTRY_VERSION => json.registry,
        Ok(json) => {
            warn!(
                version = json.version,
                "unsupported registry version, starting fresh"
            );
            HashMap::new()
        }
        Err(e) => {
            warn!(error = %e, "could not parse registry, starting fresh");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use tempfile::TempDir;

    fn make_message(identifier: &str, offset: i64, timestamp: &str) -> PipelineMessage {
        PipelineMessage::Log(Message {
            content: b"payload".to_vec(),
            truncated: false,
            origin: Origin {
                identifier: identifier.to_string(),
                offset,
                timestamp: timestamp.to_string(),
                ..Origin::default()
            },
        })
    }

    fn fast_auditor(dir: &TempDir) -> Auditor {
        Auditor::new(dir.path()).with_periods(
            Duration::from_millis(20),
            Duration::from_secs(300),
            TimeDelta::hours(23),
        )
    }

    #[tokio::test]
    async fn test_commit_flush_and_recover() {
        let dir = TempDir::new().unwrap();

        let auditor = fast_auditor(&dir);
        let (tx, rx) = mpsc::channel(10);
        let handle = auditor.start(rx);

        tx.send(make_message("file:/var/log/test.log", 42, ""))
            .await
            .unwrap();
        tx.send(make_message("file:/var/log/test.log", 64, ""))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(tx);
        handle.await.unwrap();

        // A fresh auditor over the same run path resumes from the highest
        // committed offset.
        let restarted = fast_auditor(&dir);
        let (tx2, rx2) = mpsc::channel(10);
        let handle2 = restarted.start(rx2);
        assert_eq!(
            restarted.last_committed_offset("file:/var/log/test.log"),
            SeekFrom::Current(64)
        );
        drop(tx2);
        handle2.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_identifier_tails_from_end() {
        let dir = TempDir::new().unwrap();
        let auditor = Auditor::new(dir.path());
        assert_eq!(
            auditor.last_committed_offset("file:/never/seen"),
            SeekFrom::End(0)
        );
        assert_eq!(auditor.last_committed_timestamp("docker:none"), "");
    }

    #[tokio::test]
    async fn test_timestamp_commit() {
        let dir = TempDir::new().unwrap();
        let auditor = fast_auditor(&dir);
        let (tx, rx) = mpsc::channel(10);
        let handle = auditor.start(rx);

        tx.send(make_message("docker:abc", 0, "2024-05-01T10:00:00.000000001Z"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            auditor.last_committed_timestamp("docker:abc"),
            "2024-05-01T10:00:00.000000001Z"
        );

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_identifier_is_not_tracked() {
        let dir = TempDir::new().unwrap();
        let auditor = fast_auditor(&dir);
        let (tx, rx) = mpsc::channel(10);
        let handle = auditor.start(rx);

        tx.send(make_message("", 42, "")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(auditor.last_committed_offset(""), SeekFrom::End(0));
    }

    #[tokio::test]
    async fn test_expired_entries_are_cleaned_on_start() {
        let dir = TempDir::new().unwrap();

        let mut registry = HashMap::new();
        registry.insert(
            "file:/var/log/stale.log".to_string(),
            RegistryEntry {
                offset: 10,
                timestamp: String::new(),
                last_updated: Utc::now() - TimeDelta::hours(48),
            },
        );
        registry.insert(
            "file:/var/log/fresh.log".to_string(),
            RegistryEntry {
                offset: 20,
                timestamp: String::new(),
                last_updated: Utc::now(),
            },
        );
        let json = JsonRegistry {
            version: REGISTRY_VERSION,
            registry,
        };
        std::fs::write(
            dir.path().join("registry.json"),
            serde_json::to_vec(&json).unwrap(),
        )
        .unwrap();

        let auditor = fast_auditor(&dir);
        let (tx, rx) = mpsc::channel(10);
        let handle = auditor.start(rx);

        assert_eq!(
            auditor.last_committed_offset("file:/var/log/stale.log"),
            SeekFrom::End(0)
        );
        assert_eq!(
            auditor.last_committed_offset("file:/var/log/fresh.log"),
            SeekFrom::Current(20)
        );

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let mut registry = HashMap::new();
        registry.insert(
            "file:/var/log/test.log".to_string(),
            RegistryEntry {
                offset: 10,
                timestamp: String::new(),
                last_updated: Utc::now(),
            },
        );
        let json = JsonRegistry {
            version: 99,
            registry,
        };
        std::fs::write(
            dir.path().join("registry.json"),
            serde_json::to_vec(&json).unwrap(),
        )
        .unwrap();

        let auditor = fast_auditor(&dir);
        let (tx, rx) = mpsc::channel(10);
        let handle = auditor.start(rx);

        assert_eq!(
            auditor.last_committed_offset("file:/var/log/test.log"),
            SeekFrom::End(0)
        );

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_file_format() {
        let dir = TempDir::new().unwrap();
        let auditor = fast_auditor(&dir);
        let (tx, rx) = mpsc::channel(10);
        let handle = auditor.start(rx);

        tx.send(make_message("file:/var/log/test.log", 42, ""))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(tx);
        handle.await.unwrap();

        let bytes = std::fs::read(dir.path().join("registry.json")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["Version"], 0);
        assert_eq!(value["Registry"]["file:/var/log/test.log"]["Offset"], 42);
        assert!(value["Registry"]["file:/var/log/test.log"]["LastUpdated"].is_string());
    }
}
