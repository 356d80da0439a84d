//! Speech engines: interchangeable backends that turn a chunk of text into
//! playable audio.
//!
//! Components:
//! - `native`: on-device Kokoro ONNX synthesis
//! - `server`: audio rendered by the book server and fetched over HTTP
//! - `audio`: rodio output shared by both
//!
//! Engines only produce audio. Sequencing, pausing and jumping live in the
//! coordinator and behave the same whichever engine is active.

pub mod audio;
pub mod native;
pub mod server;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chunk::PageChunk;
use crate::config::Config;
use crate::error::{Result, TtsError};

pub const MIN_RATE: f32 = 0.25;
pub const MAX_RATE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Native,
    Server,
}

impl EngineKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "native" | "local" => Some(Self::Native),
            "server" | "network" => Some(Self::Server),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// A voice offered by an engine. URIs are only meaningful to the engine
/// that listed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub voice_uri: String,
    /// BCP 47 tag, e.g. "en-US".
    pub lang: String,
    pub name: String,
    #[serde(default)]
    pub default: bool,
}

impl Voice {
    fn primary_language(&self) -> &str {
        self.lang.split(['-', '_']).next().unwrap_or_default()
    }
}

/// What a chunk should be spoken with. Read when its audio is loaded, so
/// changes land on the next chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSettings {
    pub voice: Option<Voice>,
    pub rate: f32,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 1.0,
        }
    }
}

pub fn clamp_rate(rate: f32) -> f32 {
    if rate.is_finite() {
        rate.clamp(MIN_RATE, MAX_RATE)
    } else {
        1.0
    }
}

/// Audio for one chunk. Created paused; `play` starts it and also resumes
/// it from where `pause` left off.
#[async_trait]
pub trait Utterance: Send + Sync {
    fn play(&self);
    fn pause(&self);
    /// Discard the audio. `finished` resolves afterwards.
    fn stop(&self);
    fn set_rate(&self, rate: f32);
    /// Resolves once the audio has played out or was stopped.
    async fn finished(&self);
}

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// One-time setup such as loading models or voice lists.
    async fn init(&self) -> Result<()>;

    /// Empty until `init` has completed.
    fn voices(&self) -> Vec<Voice>;

    /// Produce audio for a chunk. May block on synthesis or a fetch.
    async fn load(&self, chunk: &PageChunk, settings: &SpeechSettings) -> Result<Box<dyn Utterance>>;
}

/// Choose between engines given their capability checks. A forced kind is
/// honored even when its check failed.
pub fn choose_engine(
    forced: Option<EngineKind>,
    native_supported: bool,
    server_supported: bool,
) -> Option<EngineKind> {
    if let Some(kind) = forced {
        return Some(kind);
    }
    if native_supported {
        Some(EngineKind::Native)
    } else if server_supported {
        Some(EngineKind::Server)
    } else {
        None
    }
}

/// Check the platform and pick an engine. `Unsupported` means read-aloud
/// has to stay hidden.
pub fn select_engine(config: &Config, forced: Option<EngineKind>) -> Result<EngineKind> {
    if let Some(kind) = forced {
        info!("Speech engine forced to {kind}");
        return Ok(kind);
    }
    let native_supported = native::NativeEngine::is_supported(&config.native);
    let server_supported = server::ServerEngine::is_supported(&config.engine);
    info!("Speech engine support: native={native_supported} server={server_supported}");
    choose_engine(None, native_supported, server_supported).ok_or(TtsError::Unsupported)
}

pub fn build_engine(kind: EngineKind, config: &Config) -> Result<Arc<dyn SpeechEngine>> {
    let output = Arc::new(audio::AudioOutput::new());
    Ok(match kind {
        EngineKind::Native => Arc::new(native::NativeEngine::new(&config.native, output)),
        EngineKind::Server => Arc::new(server::ServerEngine::new(config.engine.clone(), output)?),
    })
}

/// Pick the voice that best fits the book: one in the book's language and
/// a locale the reader prefers, then any voice in the book's language, then
/// the engine default.
pub fn best_voice(
    voices: &[Voice],
    book_language: Option<&str>,
    user_languages: &[String],
) -> Option<Voice> {
    let fallback = || voices.iter().find(|v| v.default).or(voices.first()).cloned();

    let Some(book_language) = book_language else {
        return fallback();
    };
    let book_voices: Vec<&Voice> = voices
        .iter()
        .filter(|v| v.primary_language().eq_ignore_ascii_case(book_language))
        .collect();
    if book_voices.is_empty() {
        return fallback();
    }

    for locale in user_languages {
        let matching: Vec<&&Voice> = book_voices
            .iter()
            .filter(|v| v.lang.replace('_', "-").eq_ignore_ascii_case(locale))
            .collect();
        if let Some(voice) = matching.iter().find(|v| v.default).or(matching.first()) {
            return Some((**voice).clone());
        }
    }

    book_voices
        .iter()
        .find(|v| v.default)
        .or(book_voices.first())
        .map(|v| (*v).clone())
}
