//! Network speech: audio rendered by the book server, fetched per chunk.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use rodio::Decoder;
use tracing::{debug, info};

use super::audio::{AudioOutput, SinkUtterance};
use super::{EngineKind, SpeechEngine, SpeechSettings, Utterance, Voice};
use crate::chunk::PageChunk;
use crate::config::EngineOptions;
use crate::error::{Result, TtsError};

const TTS_ENDPOINT: &str = "/BookReader/BookReaderGetTTS.php";
const AUDIO_FORMAT: &str = "mp3";

pub struct ServerEngine {
    options: EngineOptions,
    client: Client,
    output: Arc<AudioOutput>,
}

impl ServerEngine {
    pub fn new(options: EngineOptions, output: Arc<AudioOutput>) -> Result<Self> {
        // no timeout: a stalled fetch stays in the loading phase until stopped
        let client = Client::builder().build()?;
        Ok(Self {
            options,
            client,
            output,
        })
    }

    /// A server is configured and there is somewhere to play audio.
    pub fn is_supported(options: &EngineOptions) -> bool {
        !options.server.trim().is_empty() && AudioOutput::device_available()
    }

    fn language(&self) -> &str {
        self.options.book_language.as_deref().unwrap_or("en")
    }

    fn endpoint(&self) -> String {
        let server = self.options.server.trim().trim_end_matches('/');
        if server.starts_with("http://") || server.starts_with("https://") {
            format!("{server}{TTS_ENDPOINT}")
        } else {
            format!("https://{server}{TTS_ENDPOINT}")
        }
    }

    async fn fetch(&self, chunk: &PageChunk) -> std::result::Result<Vec<u8>, String> {
        let resp = self
            .client
            .get(self.endpoint())
            .query(&[
                ("string", chunk.text.as_str()),
                ("format", AUDIO_FORMAT),
                ("lang", self.language()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    format!("cannot connect to {}", self.options.server)
                } else {
                    format!("request failed: {e}")
                }
            })?;

        if !resp.status().is_success() {
            return Err(format!("server returned status {}", resp.status()));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| format!("failed to read audio: {e}"))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SpeechEngine for ServerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Server
    }

    async fn init(&self) -> Result<()> {
        info!("Server speech via {}", self.endpoint());
        Ok(())
    }

    fn voices(&self) -> Vec<Voice> {
        let lang = self.language();
        vec![Voice {
            voice_uri: format!("server:{lang}"),
            lang: lang.to_string(),
            name: format!("Server voice ({lang})"),
            default: true,
        }]
    }

    async fn load(&self, chunk: &PageChunk, _settings: &SpeechSettings) -> Result<Box<dyn Utterance>> {
        let t0 = Instant::now();
        let audio = self
            .fetch(chunk)
            .await
            .map_err(|e| TtsError::load_failure(chunk.leaf_index, e))?;
        debug!(
            "Fetched {} bytes for page {} chunk {} in {}ms",
            audio.len(),
            chunk.leaf_index,
            chunk.index,
            t0.elapsed().as_millis()
        );

        let source = Decoder::new(Cursor::new(audio))
            .map_err(|e| TtsError::load_failure(chunk.leaf_index, format!("undecodable audio: {e}")))?;

        let sink = self.output.paused_sink()?;
        sink.append(source);
        Ok(Box::new(SinkUtterance::new(sink)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(server: &str, lang: Option<&str>) -> ServerEngine {
        let options = EngineOptions {
            server: server.into(),
            book_path: "/details/book".into(),
            book_language: lang.map(String::from),
        };
        ServerEngine::new(options, Arc::new(AudioOutput::new())).unwrap()
    }

    #[test]
    fn endpoint_defaults_to_https() {
        assert_eq!(
            engine("ia800.us.archive.org", None).endpoint(),
            "https://ia800.us.archive.org/BookReader/BookReaderGetTTS.php"
        );
        assert_eq!(
            engine("http://localhost:8080/", None).endpoint(),
            "http://localhost:8080/BookReader/BookReaderGetTTS.php"
        );
    }

    #[test]
    fn single_voice_in_book_language() {
        let voices = engine("example.org", Some("de")).voices();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].lang, "de");
        assert!(voices[0].default);
    }

    #[test]
    fn unconfigured_server_is_unsupported() {
        let options = EngineOptions {
            server: "  ".into(),
            ..EngineOptions::default()
        };
        assert!(!ServerEngine::is_supported(&options));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_load_failure() {
        let engine = engine("http://127.0.0.1:9", None);
        let chunk = PageChunk {
            text: "Hello.".into(),
            leaf_index: 7,
            index: 0,
            line_rects: vec![],
        };
        let err = engine
            .load(&chunk, &SpeechSettings::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TtsError::LoadFailure { leaf_index: 7, .. }));
    }
}
