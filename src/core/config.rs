//! Profile configuration: default route, system prompt, sampling
//! defaults, and the legacy per-provider key table.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::auth::{Provider, Route};

/// Profile-level sampling defaults. A runtime override always wins
/// over these when the request is built.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SamplingDefaults {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub json_mode: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    pub default_provider: Option<String>,
    /// Default model per provider id.
    #[serde(default)]
    pub default_models: HashMap<String, String>,
    /// System prompt applied to every generation under this profile.
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub sampling: SamplingDefaults,
    /// Legacy per-provider API keys kept in the profile file. The vault
    /// is preferred for new setups; these are still honored, after any
    /// runtime-injected key.
    #[serde(default)]
    pub provider_keys: HashMap<String, String>,
}

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config at {}: {}", path.display(), source)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Config {
    pub fn config_path() -> Result<PathBuf, Box<dyn StdError>> {
        let dirs = ProjectDirs::from("org", "permacommons", "parley")
            .ok_or("Could not determine a config directory for this platform")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn load() -> Result<Config, Box<dyn StdError>> {
        Ok(Self::load_from_path(&Self::config_path()?)?)
    }

    /// Load from an explicit path. A missing file yields the defaults;
    /// unreadable or invalid files are reported, not silently replaced.
    pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self) -> Result<(), Box<dyn StdError>> {
        self.save_to_path(&Self::config_path()?)
    }

    /// Atomic write: serialize to a temp file in the target directory,
    /// then rename over the destination.
    pub fn save_to_path(&self, path: &Path) -> Result<(), Box<dyn StdError>> {
        let parent = path.parent().ok_or("Config path has no parent directory")?;
        fs::create_dir_all(parent)?;
        let serialized = toml::to_string_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(serialized.as_bytes())?;
        tmp.persist(path)?;
        Ok(())
    }

    /// Default route for the panel: configured provider (or OpenAI),
    /// with the configured model for that provider or its stock model.
    pub fn default_route(&self) -> Route {
        let provider = self
            .default_provider
            .as_deref()
            .and_then(Provider::from_id)
            .unwrap_or(Provider::OpenAi);
        Route::new(provider, self.model_for(provider))
    }

    pub fn model_for(&self, provider: Provider) -> String {
        self.default_models
            .get(provider.id())
            .cloned()
            .unwrap_or_else(|| provider.default_model().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = Config::load_from_path(&dir.path().join("config.toml")).expect("load");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut config = Config {
            default_provider: Some("anthropic".to_string()),
            system_prompt: Some("Be terse.".to_string()),
            ..Config::default()
        };
        config
            .default_models
            .insert("anthropic".to_string(), "claude-sonnet-4-5".to_string());
        config.sampling.temperature = Some(0.4);
        config
            .provider_keys
            .insert("openai".to_string(), "sk-profile".to_string());

        config.save_to_path(&path).expect("save");
        let loaded = Config::load_from_path(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "default_provider = [not toml").expect("write");
        match Config::load_from_path(&path) {
            Err(ConfigError::Parse { .. }) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn default_route_falls_back_to_openai_stock_model() {
        let config = Config::default();
        let route = config.default_route();
        assert_eq!(route.provider, Provider::OpenAi);
        assert_eq!(route.model, Provider::OpenAi.default_model());
    }

    #[test]
    fn default_route_honors_configured_provider_and_model() {
        let mut config = Config {
            default_provider: Some("ollama".to_string()),
            ..Config::default()
        };
        config
            .default_models
            .insert("ollama".to_string(), "qwen2.5".to_string());
        let route = config.default_route();
        assert_eq!(route.provider, Provider::Ollama);
        assert_eq!(route.model, "qwen2.5");
    }
}
