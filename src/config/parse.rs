use super::types::*;
use regex::bytes::Regex;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("invalid pattern in rule '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Loads and validates the agent configuration, compiling every
/// processing-rule pattern up front so rule application cannot fail at
/// runtime.
pub fn load_config(path: &Path) -> Result<(Config, Vec<Arc<LogSourceConfig>>), ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    validate_config(&config)?;

    if config.hostname.is_empty() {
        config.hostname = os_hostname();
    }

    let sources = config
        .sources
        .iter()
        .map(compile_source)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((config, sources))
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.api_key.is_empty() {
        return Err(ConfigError::Validation("api_key must be set".to_string()));
    }
    for (idx, source) in config.sources.iter().enumerate() {
        match source.kind {
            SourceKind::File if source.path.is_none() => {
                return Err(ConfigError::Validation(format!(
                    "source #{idx}: file sources require a path"
                )));
            }
            SourceKind::Tcp | SourceKind::Udp if source.port.is_none() => {
                return Err(ConfigError::Validation(format!(
                    "source #{idx}: network sources require a port"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Compiles one raw source entry into its shareable descriptor.
pub fn compile_source(raw: &RawSourceConfig) -> Result<Arc<LogSourceConfig>, ConfigError> {
    let mut rules = Vec::with_capacity(raw.processing_rules.len());
    for rule in &raw.processing_rules {
        let regex = Regex::new(&rule.pattern).map_err(|e| ConfigError::InvalidPattern {
            name: if rule.name.is_empty() {
                rule.pattern.clone()
            } else {
                rule.name.clone()
            },
            source: e,
        })?;
        rules.push(ProcessingRule {
            kind: rule.kind,
            name: rule.name.clone(),
            regex,
            placeholder: rule.replace_placeholder.clone().into_bytes(),
        });
    }

    Ok(Arc::new(LogSourceConfig {
        kind: raw.kind,
        path: raw.path.clone(),
        port: raw.port,
        image: raw.image.clone(),
        label: raw.label.clone(),
        service: raw.service.clone(),
        logset: raw.logset.clone(),
        source: raw.source.clone(),
        source_category: raw.source_category.clone(),
        tags: raw.tags.clone(),
        tags_payload: build_tags_payload(&raw.tags, &raw.source, &raw.source_category),
        processing_rules: rules,
    }))
}

/// Renders the pre-built tags blob embedded in the intake preamble. Empty
/// groups are omitted; when everything is empty the payload is a single
/// dash.
pub fn build_tags_payload(tags: &str, source: &str, source_category: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    if !source.is_empty() {
        payload.extend_from_slice(format!("[dd ddsource=\"{source}\"]").as_bytes());
    }
    if !source_category.is_empty() {
        payload.extend_from_slice(format!("[dd ddsourcecategory=\"{source_category}\"]").as_bytes());
    }
    if !tags.is_empty() {
        payload.extend_from_slice(format!("[dd ddtags=\"{tags}\"]").as_bytes());
    }
    if payload.is_empty() {
        payload.push(b'-');
    }
    payload
}

fn os_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "could not resolve hostname, falling back to 'unknown'");
            "unknown".to_string()
        }
    }
}
