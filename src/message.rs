use crate::config::types::LogSourceConfig;
use std::sync::Arc;

/// Syslog priority written in front of info-level lines.
pub const SEV_INFO: &[u8] = b"<46>";
/// Syslog priority written in front of error-level lines.
pub const SEV_ERROR: &[u8] = b"<43>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Info,
    Error,
}

impl Severity {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Severity::Info => SEV_INFO,
            Severity::Error => SEV_ERROR,
        }
    }
}

/// Where a message came from and how far its source has been consumed.
///
/// `identifier` keys the auditor registry; an empty identifier means the
/// message's progress is not tracked (network sources, or a tailer that is
/// being torn down for rotation).
#[derive(Debug, Clone, Default)]
pub struct Origin {
    pub source: Option<Arc<LogSourceConfig>>,
    pub identifier: String,
    pub offset: i64,
    pub timestamp: String,
    pub severity: Severity,
    pub tags_payload: Vec<u8>,
}

impl Origin {
    /// The tags blob for this message: the per-message payload when the
    /// source adapter computed one (containers), otherwise the source's
    /// pre-rendered blob.
    pub fn tags_payload(&self) -> &[u8] {
        if !self.tags_payload.is_empty() {
            return &self.tags_payload;
        }
        match &self.source {
            Some(source) => &source.tags_payload,
            None => b"-",
        }
    }
}

/// A log line on its way to the intake.
#[derive(Debug, Clone)]
pub struct Message {
    pub content: Vec<u8>,
    pub truncated: bool,
    pub origin: Origin,
}

impl Message {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            truncated: false,
            origin: Origin::default(),
        }
    }
}

/// What flows through pipeline channels. `Stop` is the shutdown sentinel:
/// a stage that receives it forwards exactly one `Stop` downstream and
/// terminates.
#[derive(Debug)]
pub enum PipelineMessage {
    Log(Message),
    Stop,
}
