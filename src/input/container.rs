use super::tailer::READ_BUFFER_SIZE;
use crate::config::parse::build_tags_payload;
use crate::config::types::{LogSourceConfig, CHAN_SIZE};
use crate::decoder::{ContainerContext, Decoder, Payload, SourceContext};
use crate::message::{PipelineMessage, Severity};
use chrono::{DateTime, Duration as TimeDelta, SecondsFormat};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Frame header of the multiplexed container log stream: byte 0 is the
/// stream id (1 stdout, 2 stderr), bytes 4..8 the big-endian payload size.
/// The payload starts with the record's rfc3339-nano timestamp, up to the
/// first space.
const HEADER_LEN: usize = 8;

/// Resolves container tags for an entity; recomputed per message but only
/// re-rendered when the tags actually change. Tag resolution itself lives
/// outside the agent.
pub trait Tagger: Send + Sync {
    fn tags(&self, entity: &str) -> Vec<String>;
}

/// A tagger that never returns tags, for sources without enrichment.
pub struct NoopTagger;

impl Tagger for NoopTagger {
    fn tags(&self, _entity: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Tails the multiplexed stdout/stderr stream of one container. The stream
/// itself comes from the container runtime (out of scope here), so the
/// tailer accepts any `AsyncRead`: it strips frame headers, extracts the
/// per-record timestamp and severity, and feeds the remaining bytes to a
/// decoder.
pub struct ContainerTailer<R> {
    container_id: String,
    reader: R,
    source: Arc<LogSourceConfig>,
    output: mpsc::Sender<PipelineMessage>,
    tagger: Arc<dyn Tagger>,
}

impl<R: AsyncRead + Unpin + Send + 'static> ContainerTailer<R> {
    pub fn new(
        container_id: String,
        reader: R,
        source: Arc<LogSourceConfig>,
        output: mpsc::Sender<PipelineMessage>,
        tagger: Arc<dyn Tagger>,
    ) -> Self {
        Self {
            container_id,
            reader,
            source,
            output,
            tagger,
        }
    }

    pub fn identifier(&self) -> String {
        format!("docker:{}", self.container_id)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let (payload_tx, payload_rx) = mpsc::channel(CHAN_SIZE);
        let (decoded_tx, decoded_rx) = mpsc::channel(CHAN_SIZE);
        tokio::spawn(Decoder::for_source(&self.source, payload_rx, decoded_tx).run());
        tokio::spawn(forward_container_messages(
            decoded_rx,
            self.output.clone(),
            self.source.clone(),
            self.identifier(),
            self.container_id.clone(),
            self.tagger.clone(),
        ));

        let mut pending: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        if !drain_frames(&mut pending, &payload_tx).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(container = %self.container_id, error = %e, "could not read container stream");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        // Dropping the payload sender shuts the decoder down.
    }
}

/// Extracts every complete frame from `pending` and hands its record bytes
/// to the decoder with a timestamp-bearing context. Returns false when the
/// decoder is gone.
async fn drain_frames(pending: &mut Vec<u8>, payload_tx: &mpsc::Sender<Payload>) -> bool {
    while pending.len() >= HEADER_LEN {
        let size = u32::from_be_bytes([pending[4], pending[5], pending[6], pending[7]]) as usize;
        let total = HEADER_LEN + size;
        if pending.len() < total {
            return true;
        }

        let severity = if pending[0] == 2 {
            Severity::Error
        } else {
            Severity::Info
        };
        let (timestamp, content) = split_record(&pending[HEADER_LEN..total]);
        pending.drain(..total);

        let context = SourceContext::Container(ContainerContext {
            timestamp,
            severity,
        });
        if payload_tx.send(Payload::new(content, context)).await.is_err() {
            return false;
        }
    }
    true
}

/// The record is `<timestamp> <content>`; a record without a space is
/// malformed and is forwarded without a timestamp.
fn split_record(record: &[u8]) -> (String, Vec<u8>) {
    match record.iter().position(|&b| b == b' ') {
        Some(idx) => (
            String::from_utf8_lossy(&record[..idx]).into_owned(),
            record[idx + 1..].to_vec(),
        ),
        None => {
            warn!("invalid container record collected, forwarding without timestamp");
            (String::new(), record.to_vec())
        }
    }
}

/// The `since` value to resume a container's log stream from. The runtime's
/// `Since` is inclusive, so committing a timestamp and resuming from it
/// would re-emit the last line; one nanosecond past it does not.
pub fn next_log_since(last_committed: &str) -> String {
    match DateTime::parse_from_rfc3339(last_committed) {
        Ok(ts) => {
            (ts + TimeDelta::nanoseconds(1)).to_rfc3339_opts(SecondsFormat::Nanos, true)
        }
        Err(_) => last_committed.to_string(),
    }
}

async fn forward_container_messages(
    mut decoded_rx: mpsc::Receiver<PipelineMessage>,
    output: mpsc::Sender<PipelineMessage>,
    source: Arc<LogSourceConfig>,
    identifier: String,
    container_id: String,
    tagger: Arc<dyn Tagger>,
) {
    let mut container_tags: Vec<String> = Vec::new();
    let mut tags_payload: Option<Vec<u8>> = None;

    while let Some(item) = decoded_rx.recv().await {
        match item {
            PipelineMessage::Stop => return,
            PipelineMessage::Log(mut msg) => {
                let tags = tagger.tags(&container_id);
                if tags_payload.is_none() || tags != container_tags {
                    container_tags = tags;
                    tags_payload = Some(render_tags_payload(&container_tags, &source));
                }

                msg.origin.source = Some(source.clone());
                msg.origin.identifier = identifier.clone();
                msg.origin.tags_payload = tags_payload.clone().unwrap_or_default();
                if output.send(PipelineMessage::Log(msg)).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn render_tags_payload(container_tags: &[String], source: &LogSourceConfig) -> Vec<u8> {
    let mut parts: Vec<&str> = container_tags.iter().map(String::as_str).collect();
    if !source.tags.is_empty() {
        parts.push(&source.tags);
    }
    build_tags_payload(&parts.join(","), &source.source, &source.source_category)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse::compile_source;
    use crate::config::types::{RawSourceConfig, SourceKind};
    use std::io::Cursor;

    struct StaticTagger(Vec<String>);

    impl Tagger for StaticTagger {
        fn tags(&self, _entity: &str) -> Vec<String> {
            self.0.clone()
        }
    }

    fn make_source(tags: &str, source: &str) -> Arc<LogSourceConfig> {
        compile_source(&RawSourceConfig {
            kind: SourceKind::Docker,
            path: None,
            port: None,
            image: Some("nginx".to_string()),
            label: None,
            service: String::new(),
            logset: String::new(),
            source: source.to_string(),
            source_category: String::new(),
            tags: tags.to_string(),
            processing_rules: vec![],
        })
        .unwrap()
    }

    fn frame(stream: u8, record: &[u8]) -> Vec<u8> {
        let mut framed = vec![stream, 0, 0, 0];
        framed.extend_from_slice(&(record.len() as u32).to_be_bytes());
        framed.extend_from_slice(record);
        framed
    }

    async fn next_log(output: &mut mpsc::Receiver<PipelineMessage>) -> crate::message::Message {
        match output.recv().await {
            Some(PipelineMessage::Log(msg)) => msg,
            other => panic!("expected a log message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_framing_severity_and_timestamp() {
        let mut stream = Vec::new();
        stream.extend(frame(1, b"2024-05-01T10:00:00.000000001Z hello\n"));
        stream.extend(frame(2, b"2024-05-01T10:00:00.000000002Z boom\n"));

        let source = make_source("", "");
        let (tx, mut rx) = mpsc::channel(CHAN_SIZE);
        let tailer = ContainerTailer::new(
            "abc123".to_string(),
            Cursor::new(stream),
            source,
            tx,
            Arc::new(NoopTagger),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(tailer.run(shutdown_rx));

        let first = next_log(&mut rx).await;
        assert_eq!(first.content, b"hello");
        assert_eq!(first.origin.severity, Severity::Info);
        assert_eq!(first.origin.timestamp, "2024-05-01T10:00:00.000000001Z");
        assert_eq!(first.origin.identifier, "docker:abc123");

        let second = next_log(&mut rx).await;
        assert_eq!(second.content, b"boom");
        assert_eq!(second.origin.severity, Severity::Error);
        assert_eq!(second.origin.timestamp, "2024-05-01T10:00:00.000000002Z");
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let record = frame(1, b"2024-05-01T10:00:00Z split line\n");

        // Feed the frame one byte at a time through the pending buffer.
        let (payload_tx, mut payload_rx) = mpsc::channel(CHAN_SIZE);
        let mut pending = Vec::new();
        for byte in record {
            pending.push(byte);
            assert!(drain_frames(&mut pending, &payload_tx).await);
        }
        assert!(pending.is_empty());

        let payload = payload_rx.recv().await.unwrap();
        assert_eq!(payload.content, b"split line\n");
    }

    #[tokio::test]
    async fn test_tags_payload_rendered_from_tagger() {
        let stream = frame(1, b"2024-05-01T10:00:00Z tagged\n");
        let source = make_source("env:prod", "nginx");
        let (tx, mut rx) = mpsc::channel(CHAN_SIZE);
        let tailer = ContainerTailer::new(
            "abc123".to_string(),
            Cursor::new(stream),
            source,
            tx,
            Arc::new(StaticTagger(vec!["image_name:nginx".to_string()])),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(tailer.run(shutdown_rx));

        let msg = next_log(&mut rx).await;
        assert_eq!(
            msg.origin.tags_payload,
            b"[dd ddsource=\"nginx\"][dd ddtags=\"image_name:nginx,env:prod\"]".to_vec()
        );
    }

    #[test]
    fn test_split_record_without_space() {
        let (timestamp, content) = split_record(b"no-space-here");
        assert!(timestamp.is_empty());
        assert_eq!(content, b"no-space-here");
    }

    #[test]
    fn test_next_log_since_adds_a_nanosecond() {
        assert_eq!(
            next_log_since("2024-05-01T10:00:00.000000001Z"),
            "2024-05-01T10:00:00.000000002Z"
        );
        // Unparseable input is passed through untouched.
        assert_eq!(next_log_since(""), "");
        assert_eq!(next_log_since("not-a-time"), "not-a-time");
    }
}
