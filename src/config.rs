use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable overriding [`StudentsConfig::good_mark`].
pub const GOOD_MARK_ENV: &str = "STUDENTS_MARK_GOOD";

pub const DEFAULT_GOOD_MARK: i64 = 80;

/// Service configuration. Precedence: env > file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudentsConfig {
    /// Average above which a student counts as good.
    pub good_mark: i64,
}

impl Default for StudentsConfig {
    fn default() -> Self {
        Self {
            good_mark: DEFAULT_GOOD_MARK,
        }
    }
}

impl StudentsConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let cfg = Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        cfg.with_overrides(|key| env::var(key).ok())
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides looked up by variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(GOOD_MARK_ENV) {
            self.good_mark = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{GOOD_MARK_ENV} must be an integer, got '{raw}'"))
            })?;
        }
        Ok(self)
    }
}
