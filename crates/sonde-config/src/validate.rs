use crate::config::Config;
use crate::error::ConfigError;

const MAX_DELAY_MS: u64 = 10_000;

/// Validate a [`Config`], returning all detected violations.
///
/// Returns `Ok(())` when the config is valid, or `Err` with a
/// vector of every validation error found.
pub fn validate(config: &Config) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    let delays = [
        (
            "session.thread_refresh_delay_ms",
            config.session.thread_refresh_delay_ms,
        ),
        (
            "session.stack_refresh_delay_ms",
            config.session.stack_refresh_delay_ms,
        ),
    ];
    for (field, value) in delays {
        if value > MAX_DELAY_MS {
            errors.push(ConfigError::Validation {
                field: field.to_string(),
                message: format!("must be 0\u{2013}{MAX_DELAY_MS}, got {value}"),
            });
        }
    }

    let mut debug_types: Vec<&String> = config.adapters.keys().collect();
    debug_types.sort();
    for debug_type in debug_types {
        if config.adapters[debug_type].command.trim().is_empty() {
            errors.push(ConfigError::Validation {
                field: format!("adapters.{debug_type}.command"),
                message: "must not be empty".to_string(),
            });
        }
    }

    for (index, launch) in config.configurations.iter().enumerate() {
        if launch.name.trim().is_empty() {
            errors.push(ConfigError::Validation {
                field: format!("configurations[{index}].name"),
                message: "must not be empty".to_string(),
            });
        }
        if launch.request != "launch" && launch.request != "attach" {
            errors.push(ConfigError::Validation {
                field: format!("configurations[{index}].request"),
                message: format!("must be launch or attach, got '{}'", launch.request),
            });
        }
        if !config.adapters.contains_key(&launch.debug_type) {
            errors.push(ConfigError::Validation {
                field: format!("configurations[{index}].type"),
                message: format!("no adapter configured for '{}'", launch.debug_type),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
