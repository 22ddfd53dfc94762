//! Protocol definition loading.
//!
//! A few details of the Genesys grammar differ between firmware revisions (the
//! output state tokens in particular). They live in a small TOML file,
//! `genesys.toml`, looked up along the configured search path:
//!
//! ```toml
//! terminator = "\r"
//! output_on = "1"
//! output_off = "0"
//! ```

use crate::error::PsuError;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name searched for in each protocol directory.
pub const PROTOCOL_FILE_NAME: &str = "genesys.toml";

/// Firmware-dependent protocol details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDefinition {
    /// Frame terminator for requests and responses
    #[serde(default = "default_terminator")]
    pub terminator: char,
    /// Token sent for "output enabled"
    #[serde(default = "default_output_on")]
    pub output_on: String,
    /// Token sent for "output disabled"
    #[serde(default = "default_output_off")]
    pub output_off: String,
}

impl Default for ProtocolDefinition {
    fn default() -> Self {
        Self {
            terminator: default_terminator(),
            output_on: default_output_on(),
            output_off: default_output_off(),
        }
    }
}

fn default_terminator() -> char {
    '\r'
}

fn default_output_on() -> String {
    "ON".to_string()
}

fn default_output_off() -> String {
    "OFF".to_string()
}

impl ProtocolDefinition {
    /// Terminator as a byte. Only valid after [`validate`](Self::validate).
    pub fn terminator_byte(&self) -> u8 {
        u8::try_from(self.terminator).unwrap_or(super::LINE_TERM)
    }

    /// Load a definition from one TOML file.
    pub fn load(path: &Path) -> Result<Self, PsuError> {
        let definition: Self = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                PsuError::Configuration(format!(
                    "invalid protocol definition {}: {}",
                    path.display(),
                    e
                ))
            })?;
        definition.validate()?;
        Ok(definition)
    }

    /// Find the first `genesys.toml` along `search_path` and load it.
    ///
    /// Missing directories are skipped. Falls back to the built-in defaults
    /// when no file is found.
    pub fn discover(search_path: &[PathBuf]) -> Result<Self, PsuError> {
        for dir in search_path {
            let candidate = dir.join(PROTOCOL_FILE_NAME);
            if candidate.is_file() {
                info!(path = %candidate.display(), "Loading protocol definition");
                return Self::load(&candidate);
            }
            debug!(dir = %dir.display(), "No protocol definition here");
        }
        debug!("Using built-in protocol definition");
        Ok(Self::default())
    }

    /// Check the definition is usable on the wire.
    pub fn validate(&self) -> Result<(), PsuError> {
        if !matches!(self.terminator, '\r' | '\n') {
            return Err(PsuError::Configuration(format!(
                "terminator {:?} must be CR or LF",
                self.terminator
            )));
        }
        for token in [&self.output_on, &self.output_off] {
            if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(PsuError::Configuration(format!(
                    "output token {:?} must be non-empty ASCII alphanumeric",
                    token
                )));
            }
        }
        if self.output_on.eq_ignore_ascii_case(&self.output_off) {
            return Err(PsuError::Configuration(
                "output_on and output_off must differ".into(),
            ));
        }
        Ok(())
    }
}
