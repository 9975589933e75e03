use crate::config::types::{LogSourceConfig, CHAN_SIZE};
use crate::decoder::{Decoder, FileContext, Payload, SourceContext};
use crate::message::PipelineMessage;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const READ_BUFFER_SIZE: usize = 4096;
const IDLE_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TailerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tails one file: a read loop feeds 4 KiB payloads to a per-source
/// decoder, and a forward task stamps decoded messages with the source
/// descriptor and identifier before pushing them onto the assigned
/// pipeline channel.
pub struct Tailer {
    source: Arc<LogSourceConfig>,
    path: PathBuf,
    output: mpsc::Sender<PipelineMessage>,

    last_offset: Arc<AtomicI64>,
    inode: u64,
    should_track_offset: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Tailer {
    pub fn new(
        source: Arc<LogSourceConfig>,
        path: PathBuf,
        output: mpsc::Sender<PipelineMessage>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            source,
            path,
            output,
            last_offset: Arc::new(AtomicI64::new(0)),
            inode: 0,
            should_track_offset: Arc::new(AtomicBool::new(true)),
            stop_tx,
            handles: Vec::new(),
        }
    }

    pub fn identifier(&self) -> String {
        format!("file:{}", self.path.display())
    }

    /// The offset just past the last byte handed to the decoder's context;
    /// read by the rotation scanner to detect shrinkage.
    pub fn last_offset(&self) -> i64 {
        self.last_offset.load(Ordering::Relaxed)
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub async fn tail_from_beginning(&mut self) -> Result<(), TailerError> {
        self.tail_from(SeekFrom::Start(0)).await
    }

    /// Opens the file, seeks to the requested position, and spawns the
    /// decoder, forward and read tasks.
    pub async fn tail_from(&mut self, seek: SeekFrom) -> Result<(), TailerError> {
        let mut file = File::open(&self.path).await?;
        let metadata = file.metadata().await?;
        self.inode = file_inode(&metadata);

        let position = file.seek(seek).await?;
        self.last_offset.store(position as i64, Ordering::Relaxed);

        let (payload_tx, payload_rx) = mpsc::channel(CHAN_SIZE);
        let (decoded_tx, decoded_rx) = mpsc::channel(CHAN_SIZE);

        self.handles.push(tokio::spawn(
            Decoder::for_source(&self.source, payload_rx, decoded_tx).run(),
        ));
        self.handles.push(tokio::spawn(forward_messages(
            decoded_rx,
            self.output.clone(),
            self.source.clone(),
            self.identifier(),
            self.should_track_offset.clone(),
        )));
        self.handles.push(tokio::spawn(read_forever(
            file,
            self.path.clone(),
            payload_tx,
            FileContext::new(self.last_offset.clone()),
            self.stop_tx.subscribe(),
        )));

        info!(path = %self.path.display(), ?seek, "tailing file");
        Ok(())
    }

    /// Stops the read loop and waits for the decoder to drain and the
    /// forward task to push every in-flight message, so callers can tear
    /// the pipeline down afterwards without losing trailing lines. With
    /// `should_track_offset` false (rotation teardown) those messages are
    /// stripped of identifier and offset so no stale progress is committed.
    pub async fn stop(&mut self, should_track_offset: bool) {
        self.should_track_offset
            .store(should_track_offset, Ordering::Relaxed);
        let _ = self.stop_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn read_forever(
    mut file: File,
    path: PathBuf,
    payload_tx: mpsc::Sender<Payload>,
    context: FileContext,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        if *stop_rx.borrow() {
            break;
        }
        match file.read(&mut buf).await {
            Ok(0) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    changed = stop_rx.changed() => {
                        // A dropped stop handle means the tailer is gone.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(n) => {
                let payload = Payload::new(
                    buf[..n].to_vec(),
                    SourceContext::File(context.clone()),
                );
                if payload_tx.send(payload).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read file");
                break;
            }
        }
    }
    // Dropping the payload sender closes the decoder input; the decoder
    // emits its stop sentinel and the forward task winds down.
}

async fn forward_messages(
    mut decoded_rx: mpsc::Receiver<PipelineMessage>,
    output: mpsc::Sender<PipelineMessage>,
    source: Arc<LogSourceConfig>,
    identifier: String,
    should_track_offset: Arc<AtomicBool>,
) {
    while let Some(item) = decoded_rx.recv().await {
        match item {
            // The shared pipeline outlives this source; the sentinel only
            // ends the forward loop.
            PipelineMessage::Stop => return,
            PipelineMessage::Log(mut msg) => {
                msg.origin.source = Some(source.clone());
                if should_track_offset.load(Ordering::Relaxed) {
                    msg.origin.identifier = identifier.clone();
                } else {
                    msg.origin.identifier = String::new();
                    msg.origin.offset = 0;
                }
                if output.send(PipelineMessage::Log(msg)).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(unix)]
pub fn file_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
pub fn file_inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}
