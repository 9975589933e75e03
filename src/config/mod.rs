pub mod parse;
pub mod types;

use std::path::{Path, PathBuf};

pub use parse::{build_tags_payload, compile_source, load_config, ConfigError};
pub use types::{
    Config, LogSourceConfig, ProcessingRule, RuleKind, SourceKind, CHAN_SIZE, MAX_MESSAGE_LEN,
    NUMBER_OF_PIPELINES,
};

/// Resolves the config file path based on explicit argument or default
/// locations. Returns the first existing path from:
/// 1. Explicit path (if provided)
/// 2. ~/.config/skiff/config.yml
/// 3. /etc/skiff/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/skiff/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/skiff/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}
