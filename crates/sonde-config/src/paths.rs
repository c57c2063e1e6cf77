use std::path::PathBuf;

use crate::error::ConfigError;

/// Standard directory paths for sonde.
pub trait PlatformPaths: Send + Sync {
    /// Returns the configuration directory (`~/.config/sonde`).
    fn config_dir(&self) -> PathBuf;
    /// Returns the data directory (`~/.local/share/sonde`).
    fn data_dir(&self) -> PathBuf;
    /// Returns the log directory (`<data_dir>/logs`).
    fn log_dir(&self) -> PathBuf;
}

/// [`PlatformPaths`] rooted at the user's home directory.
#[derive(Debug, Clone)]
pub struct DefaultPaths {
    home: PathBuf,
}

impl DefaultPaths {
    /// Resolve the home directory via `dirs`, falling back to `$HOME`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Path`] if the home directory cannot be
    /// determined.
    pub fn new() -> Result<Self, ConfigError> {
        let home = dirs::home_dir()
            .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
            .ok_or_else(|| ConfigError::Path("could not determine home directory".into()))?;
        Ok(Self { home })
    }

    /// Paths rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }
}

impl PlatformPaths for DefaultPaths {
    fn config_dir(&self) -> PathBuf {
        self.home.join(".config").join("sonde")
    }

    fn data_dir(&self) -> PathBuf {
        self.home.join(".local").join("share").join("sonde")
    }

    fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }
}
