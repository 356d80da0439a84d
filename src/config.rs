//! Configuration management for readaloud-rs.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults so a partial (or missing) file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::engine::EngineKind;

/// Constructor-time options handed to whichever speech engine is built.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineOptions {
    /// Host serving book text and rendered speech audio.
    pub server: String,
    pub book_path: String,
    /// ISO 639-1 code, if the book declares one.
    pub book_language: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            server: String::new(),
            book_path: String::new(),
            book_language: Some("en".into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub rate: f32,
    /// Voice URI to use instead of the best match for the book language.
    pub voice: Option<String>,
    /// Locales of the reader, most preferred first (e.g. "en-GB").
    pub user_languages: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            voice: None,
            user_languages: vec!["en-US".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    pub model_path: String,
    pub voices_path: String,
    pub tokenizer_path: String,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            model_path: "kokoro-v1.0.onnx".into(),
            voices_path: "voices-v1.0.bin".into(),
            tokenizer_path: "tokenizer.json".into(),
        }
    }
}

/// Diagnostic switches, read once at launch.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Diagnostics {
    /// Skip capability detection and use this engine.
    pub force_engine: Option<EngineKind>,
    pub autoplay: bool,
}

impl Diagnostics {
    /// Parse query-style launch parameters such as
    /// `tts_engine=server&autoplay=1`. Unknown keys are ignored.
    pub fn from_launch_params(params: &str) -> Self {
        let mut diagnostics = Self::default();
        let params = params.trim_start_matches('?');

        for pair in params.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "tts_engine" => match EngineKind::from_name(value) {
                    Some(kind) => diagnostics.force_engine = Some(kind),
                    None => tracing::warn!("Unknown tts_engine in launch params: {value}"),
                },
                "autoplay" => {
                    diagnostics.autoplay = matches!(value, "" | "1" | "true" | "yes");
                }
                _ => {}
            }
        }

        diagnostics
    }

    /// Launch parameters win over whatever the config file said.
    pub fn merge(self, launch: Diagnostics) -> Self {
        Self {
            force_engine: launch.force_engine.or(self.force_engine),
            autoplay: self.autoplay || launch.autoplay,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    /// Defaults to ~/.readaloud-history when empty.
    pub dir: String,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: String::new(),
        }
    }
}

impl AnalyticsConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        if self.dir.is_empty() {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".readaloud-history")
        } else {
            PathBuf::from(&self.dir)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineOptions,
    pub playback: PlaybackConfig,
    pub native: NativeConfig,
    pub diagnostics: Diagnostics,
    pub analytics: AnalyticsConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./readaloud.yaml
    /// 2. ~/.config/readaloud/config.yaml
    /// 3. /etc/readaloud/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("readaloud.yaml")),
                dirs::home_dir().map(|h| h.join(".config/readaloud/config.yaml")),
                Some(PathBuf::from("/etc/readaloud/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::parse(
            "engine:\n  server: ia800.us.archive.org\n  book_language: fr\nplayback:\n  rate: 1.5\n",
        )
        .unwrap();

        assert_eq!(config.engine.server, "ia800.us.archive.org");
        assert_eq!(config.engine.book_language.as_deref(), Some("fr"));
        assert_eq!(config.playback.rate, 1.5);
        assert_eq!(config.playback.user_languages, vec!["en-US".to_string()]);
        assert_eq!(config.native.model_path, "kokoro-v1.0.onnx");
        assert!(config.analytics.enabled);
    }

    #[test]
    fn forced_engine_from_yaml() {
        let config = Config::parse("diagnostics:\n  force_engine: server\n  autoplay: true\n").unwrap();
        assert_eq!(config.diagnostics.force_engine, Some(EngineKind::Server));
        assert!(config.diagnostics.autoplay);
    }

    #[test]
    fn launch_params_parse() {
        let d = Diagnostics::from_launch_params("?tts_engine=native&autoplay=1&page=3");
        assert_eq!(d.force_engine, Some(EngineKind::Native));
        assert!(d.autoplay);

        let d = Diagnostics::from_launch_params("tts_engine=bogus");
        assert_eq!(d, Diagnostics::default());
    }

    #[test]
    fn launch_params_override_config() {
        let from_file = Diagnostics {
            force_engine: Some(EngineKind::Native),
            autoplay: false,
        };
        let merged = from_file.merge(Diagnostics::from_launch_params("tts_engine=server"));
        assert_eq!(merged.force_engine, Some(EngineKind::Server));
        assert!(!merged.autoplay);
    }
}
