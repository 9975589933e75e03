pub mod payload;

pub use payload::{ContainerContext, FileContext, Payload, SourceContext};

use crate::config::types::{LogSourceConfig, MAX_MESSAGE_LEN};
use crate::message::{Message, PipelineMessage};
use regex::bytes::Regex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Inserted conceptually at message boundaries when a line exceeds the
/// length budget; multi-line mode reserves room for it so a flushed message
/// plus marker still fits on the wire.
pub const TRUNCATED_MARKER: &[u8] = b"...TRUNCATED...";

/// How long a multi-line decoder holds an unfinished message before
/// flushing it when the source goes quiet.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Splits a raw byte stream into bounded messages, using `\n` for
/// single-line logs and an anchor regex for multi-line logs. One decoder
/// per source; when its input channel closes it emits a single
/// [`PipelineMessage::Stop`] and terminates.
pub struct Decoder {
    input: mpsc::Receiver<Payload>,
    output: mpsc::Sender<PipelineMessage>,

    line_buffer: Vec<u8>,
    msg_buffer: Vec<u8>,
    context: SourceContext,

    multi_line_re: Option<Regex>,
    flush_timeout: Duration,

    // Truncation bookkeeping: `next_truncated` marks the next single-line
    // emission as the tail of an oversize line; `msg_truncated` flags the
    // currently accumulating multi-line message.
    next_truncated: bool,
    msg_truncated: bool,
}

impl Decoder {
    pub fn new(
        input: mpsc::Receiver<Payload>,
        output: mpsc::Sender<PipelineMessage>,
        multi_line_re: Option<Regex>,
        flush_timeout: Duration,
    ) -> Self {
        Self {
            input,
            output,
            line_buffer: Vec::new(),
            msg_buffer: Vec::new(),
            context: SourceContext::None,
            multi_line_re,
            flush_timeout,
            next_truncated: false,
            msg_truncated: false,
        }
    }

    /// Builds a decoder configured from the source's processing rules: a
    /// `multi_line` rule selects multi-line framing.
    pub fn for_source(
        source: &LogSourceConfig,
        input: mpsc::Receiver<Payload>,
        output: mpsc::Sender<PipelineMessage>,
    ) -> Self {
        Self::new(input, output, source.multi_line_regex().cloned(), FLUSH_TIMEOUT)
    }

    fn is_multi_line(&self) -> bool {
        self.multi_line_re.is_some()
    }

    /// The most a physical line may grow before it is force-cut. Multi-line
    /// mode reserves space for the truncation marker.
    fn line_budget(&self) -> usize {
        if self.is_multi_line() {
            MAX_MESSAGE_LEN - TRUNCATED_MARKER.len()
        } else {
            MAX_MESSAGE_LEN
        }
    }

    pub async fn run(mut self) {
        loop {
            let pending = self.is_multi_line()
                && (!self.msg_buffer.is_empty() || !self.line_buffer.is_empty());
            if pending {
                tokio::select! {
                    payload = self.input.recv() => match payload {
                        Some(payload) => self.consume(payload).await,
                        None => break,
                    },
                    _ = tokio::time::sleep(self.flush_timeout) => {
                        self.flush_dormant().await;
                    }
                }
            } else {
                match self.input.recv().await {
                    Some(payload) => self.consume(payload).await,
                    None => break,
                }
            }
        }
        self.flush_dormant().await;
        let _ = self.output.send(PipelineMessage::Stop).await;
    }

    async fn consume(&mut self, payload: Payload) {
        let Payload { content, context } = payload;
        self.context = context;
        self.decode(&content).await;
    }

    /// Scans the buffer with two triggers: a newline completes a line, and
    /// a line hitting the budget is force-cut before its newline arrives.
    /// The unconsumed tail is retained for the next payload.
    async fn decode(&mut self, content: &[u8]) {
        let budget = self.line_budget();
        let n = content.len();
        let mut i = 0usize;
        let mut maxj = budget - self.line_buffer.len();
        let mut j = 0usize;
        while j < n {
            if j == maxj {
                self.line_buffer.extend_from_slice(&content[i..j]);
                self.process_forced_line().await;
                i = j;
                maxj = i + budget;
            } else if content[j] == b'\n' {
                self.line_buffer.extend_from_slice(&content[i..j]);
                self.process_completed_line().await;
                i = j + 1;
                maxj = i + budget;
            }
            j += 1;
        }
        self.line_buffer.extend_from_slice(&content[i..n]);
    }

    /// A `\n` was seen: the line is complete. The context advances past the
    /// line and its newline even when nothing is emitted (empty lines), so
    /// file offsets stay byte-exact.
    async fn process_completed_line(&mut self) {
        let line = std::mem::take(&mut self.line_buffer);
        if !self.is_multi_line() {
            self.context.advance(&line);
            self.context.advance(b"\n");
            if line.is_empty() {
                return;
            }
            let truncated = self.next_truncated;
            self.next_truncated = false;
            self.send(line, truncated).await;
            return;
        }

        let starts_message = self
            .multi_line_re
            .as_ref()
            .map_or(false, |re| re.is_match(&line));
        if starts_message {
            self.flush().await;
        }
        if !self.fits(&line) {
            self.flush().await;
        }
        self.append_line(&line);
        self.context.advance(&line);
        self.context.advance(b"\n");
    }

    /// The line hit the budget before any newline. Emit what we have as
    /// truncated, then keep accumulating the remainder, still truncated,
    /// until the next newline.
    async fn process_forced_line(&mut self) {
        let line = std::mem::take(&mut self.line_buffer);
        if !self.is_multi_line() {
            self.context.advance(&line);
            self.send(line, true).await;
            self.next_truncated = true;
            return;
        }

        self.msg_truncated = true;
        self.flush().await;
        self.msg_truncated = true;
        self.msg_buffer.extend_from_slice(&line);
        self.context.advance(&line);
    }

    /// Dormancy flush: the source went quiet with bytes still buffered.
    /// A pending partial line is folded into the message (no newline was
    /// consumed, so the context advances by the line bytes only), then the
    /// accumulated message is emitted.
    async fn flush_dormant(&mut self) {
        if !self.is_multi_line() {
            return;
        }
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            let starts_message = self
                .multi_line_re
                .as_ref()
                .map_or(false, |re| re.is_match(&line));
            if starts_message {
                self.flush().await;
            }
            if !self.fits(&line) {
                self.flush().await;
            }
            self.append_line(&line);
            self.context.advance(&line);
        }
        self.flush().await;
    }

    /// Whether the line can join the accumulating message without pushing
    /// it past `MAX_MESSAGE_LEN`, counting the two-byte separator that
    /// `append_line` inserts in front of every line after the first.
    fn fits(&self, line: &[u8]) -> bool {
        let separator = if self.msg_buffer.is_empty() { 0 } else { 2 };
        line.len() + separator <= MAX_MESSAGE_LEN.saturating_sub(self.msg_buffer.len())
    }

    /// Joins lines of a logical message with the literal two-byte `\n`
    /// sequence so the wire content never carries a raw newline.
    fn append_line(&mut self, line: &[u8]) {
        if !self.msg_buffer.is_empty() {
            self.msg_buffer.extend_from_slice(br"\n");
        }
        self.msg_buffer.extend_from_slice(line);
    }

    async fn flush(&mut self) {
        if !self.msg_buffer.is_empty() {
            let content = std::mem::take(&mut self.msg_buffer);
            let truncated = self.msg_truncated;
            self.send(content, truncated).await;
        }
        self.msg_truncated = false;
    }

    async fn send(&mut self, content: Vec<u8>, truncated: bool) {
        let msg = Message {
            content,
            truncated,
            origin: self.context.snapshot(),
        };
        let _ = self.output.send(PipelineMessage::Log(msg)).await;
    }
}
