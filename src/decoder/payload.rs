use crate::message::{Origin, Severity};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A chunk of raw bytes read from a source, paired with the context needed
/// to track consumption progress.
#[derive(Debug)]
pub struct Payload {
    pub content: Vec<u8>,
    pub context: SourceContext,
}

impl Payload {
    pub fn new(content: Vec<u8>, context: SourceContext) -> Self {
        Self { content, context }
    }
}

/// Progress-tracking context attached to a payload.
///
/// `advance` records that the decoder consumed bytes into an emitted (or
/// soon-to-be-emitted) message; `snapshot` freezes the current position into
/// an `Origin` for embedding in a message. Network sources carry `None` and
/// track nothing.
#[derive(Debug, Clone, Default)]
pub enum SourceContext {
    File(FileContext),
    Container(ContainerContext),
    #[default]
    None,
}

impl SourceContext {
    pub fn advance(&self, content: &[u8]) {
        if let SourceContext::File(ctx) = self {
            ctx.offset.fetch_add(content.len() as i64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Origin {
        match self {
            SourceContext::File(ctx) => Origin {
                offset: ctx.offset(),
                ..Origin::default()
            },
            SourceContext::Container(ctx) => Origin {
                timestamp: ctx.timestamp.clone(),
                severity: ctx.severity,
                ..Origin::default()
            },
            SourceContext::None => Origin::default(),
        }
    }
}

/// File progress: a byte offset shared with the tailer that owns the file.
/// The read loop stamps payloads with clones of this context; the decoder
/// advances it as lines are consumed, so the offset embedded in a message
/// always points just past the last consumed byte.
#[derive(Debug, Clone)]
pub struct FileContext {
    offset: Arc<AtomicI64>,
}

impl FileContext {
    pub fn new(offset: Arc<AtomicI64>) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }
}

/// Container progress: the timestamp of the record the bytes came from,
/// plus the severity derived from the stream channel.
#[derive(Debug, Clone)]
pub struct ContainerContext {
    pub timestamp: String,
    pub severity: Severity,
}
