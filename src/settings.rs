//! Persistent model settings (`~/.aigrep/config.toml`).

use crate::{
    error::{Error, Result},
    generator::SamplingParams,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_PROVIDER: &str = "vllm";
const DEFAULT_ADDRESS: &str = "http://127.0.0.1:8000/generate";
const DEFAULT_CONTEXT: usize = 4096;
const DEFAULT_PARALLEL: usize = 32;

static DEFAULT_SETTINGS: Lazy<Settings> = Lazy::new(|| Settings {
    models: vec![ModelConfig {
        frequency_penalty: 0.2,
        temperature: 0.5,
        ..ModelConfig::new("WizardLM/WizardCoder-Python-13B-V1.0")
    }],
});

/// Configuration of one generation model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model id, currently a HuggingFace id
    pub id: String,

    /// Generation engine (only `vllm` is supported)
    pub provider: String,

    /// Endpoint of the generation service
    pub address: String,

    /// Context window size in tokens
    pub context: usize,

    /// Maximum number of parallel generations
    pub parallel: usize,

    /// Prompt template in Tera syntax, overriding the built-in one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,

    /// Sampling: number of sequences to sample from before returning `n`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_of: Option<u32>,
    /// Sampling: presence penalty
    pub presence_penalty: f32,
    /// Sampling: frequency penalty
    pub frequency_penalty: f32,
    /// Sampling: temperature
    pub temperature: f32,
    /// Sampling: nucleus probability mass
    pub top_p: f32,
    /// Sampling: top-k cutoff (-1 disables)
    pub top_k: i32,
    /// Sampling: beam search instead of sampling
    pub use_beam_search: bool,
    /// Sampling: beam search length penalty
    pub length_penalty: f32,
    /// Sampling: beam search early stopping
    pub early_stopping: bool,
    /// Sampling: stop sequences
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Sampling: keep generating past end-of-sequence
    pub ignore_eos: bool,
}

impl ModelConfig {
    /// Creates a model configuration with default engine and sampling values.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Checks the fields required to talk to the model.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::config("Unspecified model id"));
        }
        if self.provider != DEFAULT_PROVIDER {
            return Err(Error::config(format!(
                "Unknown model provider: {}",
                self.provider
            )));
        }
        if self.address.is_empty() {
            return Err(Error::config("Unspecified model address"));
        }
        if self.context == 0 {
            return Err(Error::config(format!(
                "Invalid context size: {}",
                self.context
            )));
        }
        if self.parallel == 0 {
            return Err(Error::config(format!(
                "Invalid parallelism: {}",
                self.parallel
            )));
        }
        Ok(())
    }

    /// Sampling parameters configured for this model.
    #[must_use]
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            n: 1,
            max_tokens: None,
            best_of: self.best_of,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            use_beam_search: self.use_beam_search,
            length_penalty: self.length_penalty,
            early_stopping: self.early_stopping,
            stop: self.stop.clone(),
            ignore_eos: self.ignore_eos,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            provider: DEFAULT_PROVIDER.to_string(),
            address: DEFAULT_ADDRESS.to_string(),
            context: DEFAULT_CONTEXT,
            parallel: DEFAULT_PARALLEL,
            prompt_template: None,
            best_of: None,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            temperature: 1.0,
            top_p: 1.0,
            top_k: -1,
            use_beam_search: false,
            length_penalty: 1.0,
            early_stopping: false,
            stop: Vec::new(),
            ignore_eos: false,
        }
    }
}

/// The settings file: a list of configured models.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Configured models, the first one is the default
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl Settings {
    /// Built-in settings used when no settings file exists.
    #[must_use]
    pub fn builtin() -> Self {
        DEFAULT_SETTINGS.clone()
    }

    /// Default location of the settings file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".aigrep")
            .join("config.toml")
    }

    /// Loads settings from `path`, falling back to [`Settings::builtin`] when
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns a settings error if the file exists but cannot be read or
    /// parsed.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No settings file, using built-in settings");
            return Ok(Self::builtin());
        }
        Self::load(path)
    }

    /// Loads settings from `path`.
    ///
    /// # Errors
    ///
    /// Returns a settings error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        toml::from_str(&text).map_err(|e| Error::settings(path, e.to_string()))
    }

    /// Writes the settings to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any file operation fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::settings(path, e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::write(path, text).map_err(|e| Error::io(path, e))
    }

    /// Finds a model by id, or the first configured model if `id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no model matches.
    pub fn model(&self, id: Option<&str>) -> Result<&ModelConfig> {
        let found = match id {
            Some(id) => self.models.iter().find(|m| m.id == id),
            None => self.models.first(),
        };

        found.ok_or_else(|| {
            Error::config(format!(
                "No model configured with ID: {}",
                id.unwrap_or("<default>")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_builtin_settings() {
        let settings = Settings::builtin();
        let model = settings.model(None).unwrap();

        assert_eq!(model.id, "WizardLM/WizardCoder-Python-13B-V1.0");
        assert_eq!(model.context, 4096);
        assert_eq!(model.parallel, 32);
        assert!((model.temperature - 0.5).abs() < f32::EPSILON);
        model.validate().unwrap();
    }

    #[test]
    fn test_missing_file_falls_back_to_builtin() {
        let temp = assert_fs::TempDir::new().unwrap();
        let settings = Settings::load_or_builtin(&temp.path().join("none.toml")).unwrap();
        assert_eq!(settings, Settings::builtin());
    }

    #[test]
    fn test_save_and_load() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let mut settings = Settings::builtin();
        settings.models.push(ModelConfig {
            parallel: 4,
            prompt_template: Some("{{ system }} {{ instruction }}".to_string()),
            stop: vec!["</s>".to_string()],
            ..ModelConfig::new("local/model")
        });
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.model(Some("local/model")).unwrap().parallel, 4);
    }

    #[test]
    fn test_partial_model_entry_uses_defaults() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("config.toml");
        file.write_str("[[models]]\nid = \"tiny\"\ncontext = 2048\n")
            .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        let model = settings.model(Some("tiny")).unwrap();
        assert_eq!(model.context, 2048);
        assert_eq!(model.address, DEFAULT_ADDRESS);
        assert_eq!(model.top_k, -1);
    }

    #[test]
    fn test_invalid_file_is_settings_error() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("config.toml");
        file.write_str("models = 3").unwrap();

        let err = Settings::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Settings { .. }));
    }

    #[test]
    fn test_unknown_model_id() {
        let err = Settings::builtin().model(Some("nope")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_model_validation() {
        let mut model = ModelConfig::new("m");
        model.validate().unwrap();

        model.provider = "openai".to_string();
        assert!(model.validate().is_err());

        model = ModelConfig {
            parallel: 0,
            ..ModelConfig::new("m")
        };
        assert!(model.validate().is_err());
    }
}
