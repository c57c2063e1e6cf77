use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::ConfigError;
use crate::merge::merge_configs;
use crate::validate::validate;

/// Load and merge configuration.
///
/// 1. Reads the global config from `config_dir/config.toml` when present.
/// 2. Optionally reads a project config from
///    `project_dir/.sonde/config.toml` (walks upward).
/// 3. Merges: `Config::default() <- global <- project`.
/// 4. Validates the merged result.
///
/// Nothing is written; a missing global file means defaults.
///
/// # Errors
///
/// Returns [`ConfigError`] on I/O failure, parse failure, or
/// validation failure.
pub fn load_config(config_dir: &Path, project_dir: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    let global_path = config_dir.join("config.toml");
    if global_path.exists() {
        let global_content = std::fs::read_to_string(&global_path)?;
        config = merge_configs(&config, &global_content)?;
        tracing::debug!("loaded global config from {}", global_path.display());
    }

    if let Some(proj) = project_dir {
        if let Some(project_path) = find_project_config(proj) {
            let project_content = std::fs::read_to_string(&project_path)?;
            config = merge_configs(&config, &project_content)?;
            tracing::debug!("loaded project config from {}", project_path.display());
        }
    }

    check(config)
}

/// Load a single config file over the defaults.
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] when `path` does not exist.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    check(merge_configs(&Config::default(), &content)?)
}

/// Parse a TOML string directly into a validated [`Config`].
///
/// # Errors
///
/// Returns [`ConfigError`] on parse or validation failure.
pub fn load_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    check(config)
}

/// Report every violation, fail with the first.
fn check(config: Config) -> Result<Config, ConfigError> {
    let Err(errors) = validate(&config) else {
        return Ok(config);
    };
    for error in &errors {
        tracing::warn!("invalid config: {error}");
    }
    Err(errors
        .into_iter()
        .next()
        .unwrap_or_else(|| ConfigError::Validation {
            field: "unknown".to_string(),
            message: "validation failed".to_string(),
        }))
}

/// Walk from `start` upward looking for `.sonde/config.toml`.
fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(".sonde").join("config.toml");
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NODE: &str = "[adapters.node]\ncommand = \"node\"\n";

    #[test]
    fn load_config_without_files_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg_dir = tmp.path().join("config");

        let config = load_config(&cfg_dir, None).unwrap();
        assert_eq!(config, Config::default());
        assert!(!cfg_dir.exists());
    }

    #[test]
    fn load_config_reads_existing_global() {
        let tmp = TempDir::new().unwrap();
        let cfg_dir = tmp.path().join("config");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[session]\nstack_refresh_delay_ms = 40\n",
        )
        .unwrap();

        let config = load_config(&cfg_dir, None).unwrap();
        assert_eq!(config.session.stack_refresh_delay_ms, 40);
        assert_eq!(config.session.thread_refresh_delay_ms, 100);
    }

    #[test]
    fn load_config_merges_project_over_global() {
        let tmp = TempDir::new().unwrap();
        let cfg_dir = tmp.path().join("config");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(cfg_dir.join("config.toml"), NODE).unwrap();

        let proj_dir = tmp.path().join("project");
        let sonde_dir = proj_dir.join(".sonde");
        std::fs::create_dir_all(&sonde_dir).unwrap();
        std::fs::write(
            sonde_dir.join("config.toml"),
            "[[configurations]]\ntype = \"node\"\nname = \"app\"\nrequest = \"launch\"\nprogram = \"app.js\"\n",
        )
        .unwrap();

        let config = load_config(&cfg_dir, Some(&proj_dir)).unwrap();
        assert_eq!(config.adapters["node"].command, "node");
        assert_eq!(config.configurations.len(), 1);
        assert_eq!(config.configurations[0].name, "app");
    }

    #[test]
    fn load_config_validates_merged_result() {
        let tmp = TempDir::new().unwrap();
        let cfg_dir = tmp.path().join("config");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[[configurations]]\ntype = \"node\"\nname = \"app\"\nrequest = \"launch\"\n",
        )
        .unwrap();
        let err = load_config(&cfg_dir, None).unwrap_err();
        assert!(err.to_string().contains("configurations[0].type"));
    }

    #[test]
    fn load_file_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = load_file(&tmp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn load_file_reads_over_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sonde.toml");
        std::fs::write(&path, format!("{NODE}[log]\nlevel = \"trace\"\n")).unwrap();
        let config = load_file(&path).unwrap();
        assert_eq!(config.log.level.as_str(), "trace");
        assert!(config.adapters.contains_key("node"));
    }

    #[test]
    fn load_from_str_parses_valid_toml() {
        let config = load_from_str(NODE).unwrap();
        assert_eq!(config.adapters.len(), 1);
    }

    #[test]
    fn load_from_str_rejects_invalid_toml() {
        assert!(matches!(load_from_str("{{bad}}"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_from_str_rejects_invalid_values() {
        let result = load_from_str("[session]\nthread_refresh_delay_ms = 99999\n");
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn find_project_config_walks_up() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        let sonde = root.join(".sonde");
        std::fs::create_dir_all(&sonde).unwrap();
        std::fs::write(sonde.join("config.toml"), NODE).unwrap();

        let deep = root.join("src").join("module");
        std::fs::create_dir_all(&deep).unwrap();

        let found = find_project_config(&deep);
        assert!(found.unwrap().ends_with(".sonde/config.toml"));
    }
}
