pub mod config;
pub mod error;
pub mod load;
pub mod merge;
pub mod paths;
pub mod validate;

pub use config::{AdapterConfig, Config, LaunchConfig, LogConfig, LogLevel, SessionConfig};
pub use error::ConfigError;
pub use load::{load_config, load_file, load_from_str};
pub use paths::{DefaultPaths, PlatformPaths};
