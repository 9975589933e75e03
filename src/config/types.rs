use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// Technical constants.
pub const CHAN_SIZE: usize = 100;
pub const NUMBER_OF_PIPELINES: usize = 4;

/// Maximum length for any message sent to the intake.
pub const MAX_MESSAGE_LEN: usize = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: String,
    #[serde(default)]
    pub logset: String,
    #[serde(default = "default_intake_host")]
    pub log_dd_url: String,
    #[serde(default = "default_intake_port")]
    pub log_dd_port: u16,
    #[serde(default)]
    pub skip_ssl_validation: bool,
    #[serde(default = "default_run_path")]
    pub run_path: PathBuf,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_cleanup_seconds")]
    pub registry_cleanup_seconds: u64,
    #[serde(default)]
    pub sources: Vec<RawSourceConfig>,
}

fn default_intake_host() -> String {
    "intake.logs.datadoghq.com".to_string()
}

fn default_intake_port() -> u16 {
    10516
}

fn default_run_path() -> PathBuf {
    PathBuf::from("/var/lib/skiff")
}

fn default_cleanup_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Tcp,
    Udp,
    Docker,
}

/// A log source as written in the configuration file, before rule
/// compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSourceConfig {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub path: Option<PathBuf>,
    pub port: Option<u16>,
    pub image: Option<String>,
    pub label: Option<String>,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub logset: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_category: String,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub processing_rules: Vec<RawProcessingRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    ExcludeAtMatch,
    MaskSequences,
    MultiLine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProcessingRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default)]
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub replace_placeholder: String,
}

/// A processing rule with its pattern compiled. Message content is raw
/// bytes, so rules match with `regex::bytes`.
#[derive(Debug, Clone)]
pub struct ProcessingRule {
    pub kind: RuleKind,
    pub name: String,
    pub regex: Regex,
    pub placeholder: Vec<u8>,
}

/// A fully-compiled log source descriptor, shared by every message that
/// originates from it.
#[derive(Debug, Clone)]
pub struct LogSourceConfig {
    pub kind: SourceKind,
    pub path: Option<PathBuf>,
    pub port: Option<u16>,
    pub image: Option<String>,
    pub label: Option<String>,
    pub service: String,
    pub logset: String,
    pub source: String,
    pub source_category: String,
    pub tags: String,
    pub tags_payload: Vec<u8>,
    pub processing_rules: Vec<ProcessingRule>,
}

impl LogSourceConfig {
    /// The multi-line anchor regex, when one of the rules declares one.
    pub fn multi_line_regex(&self) -> Option<&Regex> {
        self.processing_rules
            .iter()
            .find(|rule| rule.kind == RuleKind::MultiLine)
            .map(|rule| &rule.regex)
    }
}
