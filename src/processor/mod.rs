use crate::message::{Message, PipelineMessage};
use crate::config::types::RuleKind;
use chrono::Utc;
use regex::bytes::NoExpand;
use tokio::sync::mpsc;

/// Turns decoded messages into intake-wire payloads: applies the source's
/// redaction rules, prepends the RFC5424-style preamble when the content is
/// not already framed, and frames everything under the api key.
pub struct Processor {
    input: mpsc::Receiver<PipelineMessage>,
    output: mpsc::Sender<PipelineMessage>,

    api_key: String,
    hostname: String,
    api_key_string: Vec<u8>,
}

impl Processor {
    pub fn new(
        input: mpsc::Receiver<PipelineMessage>,
        output: mpsc::Sender<PipelineMessage>,
        api_key: String,
        logset: String,
        hostname: String,
    ) -> Self {
        let api_key_string = if logset.is_empty() {
            api_key.clone().into_bytes()
        } else {
            format!("{api_key}/{logset}").into_bytes()
        };
        Self {
            input,
            output,
            api_key,
            hostname,
            api_key_string,
        }
    }

    pub async fn run(mut self) {
        while let Some(item) = self.input.recv().await {
            match item {
                PipelineMessage::Stop => {
                    let _ = self.output.send(PipelineMessage::Stop).await;
                    return;
                }
                PipelineMessage::Log(mut msg) => {
                    let Some(content) = self.apply_redacting_rules(&msg) else {
                        continue;
                    };
                    let extra = self.extra_content(&msg, &content);
                    let api_key_string = self.api_key_string(&msg);
                    msg.content = build_payload(api_key_string, &extra, &content);
                    if self.output.send(PipelineMessage::Log(msg)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Applies the source's rules in declared order. `exclude_at_match`
    /// short-circuits to a drop; `mask_sequences` rewrites and continues.
    fn apply_redacting_rules(&self, msg: &Message) -> Option<Vec<u8>> {
        let mut content = msg.content.clone();
        if let Some(source) = &msg.origin.source {
            for rule in &source.processing_rules {
                match rule.kind {
                    RuleKind::ExcludeAtMatch => {
                        if rule.regex.is_match(&content) {
                            return None;
                        }
                    }
                    RuleKind::MaskSequences => {
                        content = rule
                            .regex
                            .replace_all(&content, NoExpand(&rule.placeholder))
                            .into_owned();
                    }
                    // Framing rules are the decoder's concern.
                    RuleKind::MultiLine => {}
                }
            }
        }
        Some(content)
    }

    /// Content that does not already start with `<` (pre-framed syslog from
    /// the network) gets an RFC5424-style preamble:
    /// `<pri>0 <utc-timestamp> <hostname> <service|-> - - <tags_payload> `.
    fn extra_content(&self, msg: &Message, content: &[u8]) -> Vec<u8> {
        if content.first() == Some(&b'<') {
            return Vec::new();
        }

        let mut extra = Vec::new();
        extra.extend_from_slice(msg.origin.severity.as_bytes());
        extra.extend_from_slice(b"0 ");
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string();
        extra.extend_from_slice(timestamp.as_bytes());
        extra.push(b' ');
        extra.extend_from_slice(self.hostname.as_bytes());
        extra.push(b' ');
        let service = msg
            .origin
            .source
            .as_ref()
            .map(|source| source.service.as_str())
            .unwrap_or("");
        if service.is_empty() {
            extra.push(b'-');
        } else {
            extra.extend_from_slice(service.as_bytes());
        }
        extra.extend_from_slice(b" - - ");
        extra.extend_from_slice(msg.origin.tags_payload());
        extra.push(b' ');
        extra
    }

    /// `<apikey>` or `<apikey>/<logset>`, the logset coming from the
    /// message's source when it overrides the agent default.
    fn api_key_string(&self, msg: &Message) -> Vec<u8> {
        let source_logset = msg
            .origin
            .source
            .as_ref()
            .map(|source| source.logset.as_str())
            .unwrap_or("");
        if source_logset.is_empty() {
            self.api_key_string.clone()
        } else {
            format!("{}/{}", self.api_key, source_logset).into_bytes()
        }
    }
}

fn build_payload(mut api_key_string: Vec<u8>, extra: &[u8], content: &[u8]) -> Vec<u8> {
    api_key_string.push(b' ');
    api_key_string.extend_from_slice(extra);
    api_key_string.extend_from_slice(content);
    api_key_string.push(b'\n');
    api_key_string
}
