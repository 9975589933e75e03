use super::tailer::{file_inode, Tailer};
use crate::auditor::Auditor;
use crate::config::types::{LogSourceConfig, SourceKind};
use crate::message::PipelineMessage;
use crate::pipeline::PipelineProvider;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const SCAN_PERIOD: Duration = Duration::from_secs(10);

/// Watches the configured file sources: starts a tailer per file (resuming
/// from the auditor's committed offset), and on every scan restarts tailers
/// whose file was rotated (inode change) or truncated (size shrinkage),
/// from the beginning of the new file and without committing the old
/// tailer's progress.
pub struct Scanner {
    sources: Vec<(Arc<LogSourceConfig>, mpsc::Sender<PipelineMessage>)>,
    tailers: HashMap<PathBuf, Tailer>,
    auditor: Auditor,
    scan_period: Duration,
}

impl Scanner {
    pub fn new(
        sources: &[Arc<LogSourceConfig>],
        provider: &mut PipelineProvider,
        auditor: Auditor,
    ) -> Self {
        let sources = sources
            .iter()
            .filter(|source| source.kind == SourceKind::File)
            .map(|source| (source.clone(), provider.next_pipeline_chan()))
            .collect();
        Self {
            sources,
            tailers: HashMap::new(),
            auditor,
            scan_period: SCAN_PERIOD,
        }
    }

    #[cfg(test)]
    fn with_scan_period(mut self, scan_period: Duration) -> Self {
        self.scan_period = scan_period;
        self
    }

    /// Starts one tailer per configured file, resuming from the committed
    /// offset (or the end of the file for first-seen sources).
    pub async fn setup(&mut self) {
        for (source, chan) in self.sources.clone() {
            let Some(path) = source.path.clone() else {
                continue;
            };
            if self.tailers.contains_key(&path) {
                warn!(path = %path.display(), "file is already tailed, skipping duplicate source");
                continue;
            }
            self.setup_tailer(source, path, false, chan).await;
        }
    }

    async fn setup_tailer(
        &mut self,
        source: Arc<LogSourceConfig>,
        path: PathBuf,
        tail_from_beginning: bool,
        chan: mpsc::Sender<PipelineMessage>,
    ) {
        let mut tailer = Tailer::new(source, path.clone(), chan);
        let result = if tail_from_beginning {
            tailer.tail_from_beginning().await
        } else {
            let seek = self.auditor.last_committed_offset(&tailer.identifier());
            tailer.tail_from(seek).await
        };
        match result {
            Ok(()) => {
                self.tailers.insert(path, tailer);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not tail file");
            }
        }
    }

    /// Scans until told to shut down, then stops every tailer, committing
    /// their final offsets. Returns only once every tailer has drained its
    /// in-flight messages into the pipeline, so the caller can sweep the
    /// pipelines down afterwards without racing a trailing log line.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.scan_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan().await,
                _ = shutdown.changed() => break,
            }
        }
        self.stop(true).await;
    }

    /// Compares every tailed file against the filesystem and restarts the
    /// tailers whose file was rotated out from under them.
    async fn scan(&mut self) {
        for (source, chan) in self.sources.clone() {
            let Some(path) = source.path.clone() else {
                continue;
            };

            let Some(tailer) = self.tailers.get(&path) else {
                // The file may have appeared after startup.
                if path.exists() {
                    self.setup_tailer(source, path, true, chan).await;
                }
                continue;
            };

            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };

            let rotated = file_inode(&metadata) != tailer.inode();
            let shrunk = (metadata.len() as i64) < tailer.last_offset();
            if rotated || shrunk {
                info!(path = %path.display(), rotated, shrunk, "file rotated, restarting tailer");
                if let Some(mut old) = self.tailers.remove(&path) {
                    old.stop(false).await;
                }
                self.setup_tailer(source, path, true, chan).await;
            }
        }
    }

    /// Stops and joins every tailer; completes only after their decoders
    /// have drained and their forward tasks have pushed the last message.
    pub async fn stop(&mut self, should_track_offset: bool) {
        for (_, mut tailer) in self.tailers.drain() {
            tailer.stop(should_track_offset).await;
        }
    }
}
