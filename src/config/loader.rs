//! Settings loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ServerSettings;

/// Error type for settings loading.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load settings from a TOML file.
///
/// Values are only checked for shape here; range validation happens when the
/// resulting options are applied.
pub fn load_settings(path: &Path) -> Result<ServerSettings, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_settings(&content)
}

/// Parse settings from TOML text.
pub fn parse_settings(content: &str) -> Result<ServerSettings, LoadError> {
    Ok(toml::from_str(content)?)
}
