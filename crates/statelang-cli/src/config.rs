//! Engine configuration loader.
//!
//! Reads `config.toml` from an explicit path, or from
//! `{config_dir}/statelang/config.toml` when none is given, and deserializes
//! it into [`EngineConfig`]. A missing default file yields the defaults; an
//! explicit path must exist and parse.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use statelang_types::config::EngineConfig;

/// Platform location of the default `config.toml`.
///
/// Priority:
/// 1. `STATELANG_CONFIG_DIR` environment variable
/// 2. Platform config directory (e.g. `~/.config/statelang` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("STATELANG_CONFIG_DIR") {
        return Some(PathBuf::from(dir).join("config.toml"));
    }
    dirs::config_dir().map(|dir| dir.join("statelang").join("config.toml"))
}

/// Load the engine configuration for one CLI invocation.
pub async fn load_engine_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = explicit {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        return parse_config(&content).with_context(|| format!("invalid config file {}", path.display()));
    }

    let Some(path) = default_config_path() else {
        return Ok(EngineConfig::default());
    };
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", path.display());
            return Ok(EngineConfig::default());
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return Ok(EngineConfig::default());
        }
    };
    parse_config(&content).with_context(|| format!("invalid config file {}", path.display()))
}

fn parse_config(content: &str) -> Result<EngineConfig> {
    Ok(toml::from_str::<EngineConfig>(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use statelang_types::definition::QueryLanguage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn explicit_file_is_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
query_language = "JSONata"
max_transitions = 500
cancel_wave_on_threshold = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(Some(&path)).await.unwrap();
        assert_eq!(config.query_language, QueryLanguage::Functional);
        assert_eq!(config.max_transitions, 500);
        assert!(config.cancel_wave_on_threshold);
        assert_eq!(config.max_choice_depth, EngineConfig::default().max_choice_depth);
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let result = load_engine_config(Some(&tmp.path().join("absent.toml"))).await;
        assert!(result.is_err());
    }

    #[test]
    fn empty_config_uses_defaults() {
        assert_eq!(parse_config("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn malformed_config_is_rejected() {
        assert!(parse_config("max_transitions = \"lots\"").is_err());
    }
}
