//! On-device speech: Kokoro ONNX synthesis played through rodio.
//!
//! Pipeline per chunk:
//! 1. Text → sentences (split on .!?)
//! 2. Sentence → phonemes (misaki-rs G2P)
//! 3. Phonemes → token IDs (tokenizer.json vocabulary)
//! 4. Token IDs + voice style → ONNX inference → f32 audio (24kHz)
//! 5. Sentences concatenated into one paused sink

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use rodio::buffer::SamplesBuffer;
use tracing::{debug, info, warn};

use super::audio::{AudioOutput, SinkUtterance};
use super::{EngineKind, SpeechEngine, SpeechSettings, Utterance, Voice};
use crate::chunk::PageChunk;
use crate::config::NativeConfig;
use crate::error::{Result, TtsError};

const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension
const DEFAULT_VOICE: &str = "af_heart";

/// Kokoro voice names start with a language letter: "af_heart", "bm_george".
fn voice_language(name: &str) -> &'static str {
    match name.chars().next() {
        Some('b') => "en-GB",
        Some('e') => "es-ES",
        Some('f') => "fr-FR",
        Some('h') => "hi-IN",
        Some('i') => "it-IT",
        Some('j') => "ja-JP",
        Some('p') => "pt-BR",
        Some('z') => "zh-CN",
        _ => "en-US",
    }
}

fn voice_display_name(name: &str) -> String {
    let base = name.split_once('_').map_or(name, |(_, n)| n);
    let mut chars = base.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => name.to_string(),
    }
}

/// Loaded model, tokenizer, phonemizer and voice styles.
struct KokoroModel {
    // ort 2.0 Session::run needs &mut
    session: Mutex<ort::session::Session>,
    phonemizer: misaki_rs::G2P,
    vocab: HashMap<char, i64>,
    /// name → style vectors indexed by token count, shape (510, 256)
    voices: HashMap<String, Array2<f32>>,
}

impl KokoroModel {
    /// Blocking; run on a blocking thread.
    fn load(paths: &ModelPaths) -> Result<Self> {
        let t0 = Instant::now();

        info!("Loading tokenizer from {}", paths.tokenizer.display());
        let vocab = load_tokenizer(&paths.tokenizer)?;
        info!("Tokenizer loaded: {} tokens", vocab.len());

        info!("Loading voices from {}", paths.voices.display());
        let voices = load_voices(&paths.voices)?;
        info!("Loaded {} voices", voices.len());

        info!("Loading ONNX model from {}", paths.model.display());
        let session = ort::session::Session::builder()
            .map_err(|e| onnx_error(&paths.model, e))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| onnx_error(&paths.model, e))?
            .with_intra_threads(4)
            .map_err(|e| onnx_error(&paths.model, e))?
            .commit_from_file(&paths.model)
            .map_err(|e| onnx_error(&paths.model, e))?;

        let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

        info!("Kokoro loaded in {}ms", t0.elapsed().as_millis());
        Ok(Self {
            session: Mutex::new(session),
            phonemizer,
            vocab,
            voices,
        })
    }

    fn voice_list(&self) -> Vec<Voice> {
        let mut names: Vec<&String> = self.voices.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| Voice {
                voice_uri: name.clone(),
                lang: voice_language(name).to_string(),
                name: voice_display_name(name),
                default: name == DEFAULT_VOICE,
            })
            .collect()
    }

    /// Synthesize a whole chunk, sentence by sentence.
    fn synthesize(&self, text: &str, voice: &str) -> std::result::Result<Vec<f32>, String> {
        let mut samples = Vec::new();
        for sentence in split_sentences(text.trim()) {
            match self.generate(sentence, voice) {
                Ok(s) => samples.extend(s),
                Err(e) => warn!("Synthesis failed for \"{sentence}\": {e}"),
            }
        }
        if samples.is_empty() {
            return Err("no audio produced".into());
        }
        Ok(samples)
    }

    /// Generate audio samples for a single sentence.
    fn generate(&self, text: &str, voice: &str) -> std::result::Result<Vec<f32>, String> {
        // 1. Text → phonemes via misaki-rs G2P
        let (phonemes, _tokens) = self
            .phonemizer
            .g2p(text)
            .map_err(|e| format!("Phonemization failed: {e}"))?;

        if phonemes.is_empty() {
            return Ok(Vec::new());
        }

        // 2. Phonemes → token IDs, unknown characters skipped
        let mut token_ids: Vec<i64> = Vec::with_capacity(phonemes.len() + 2);
        token_ids.push(0);
        token_ids.extend(phonemes.chars().filter_map(|ch| self.vocab.get(&ch).copied()));
        token_ids.push(0);

        let n_tokens = token_ids.len().min(MAX_TOKENS);
        token_ids.truncate(n_tokens);

        // 3. Voice style vector for this token count
        let styles = self
            .voices
            .get(voice)
            .ok_or_else(|| format!("Voice not found: {voice}"))?;
        let style_idx = style_index(styles.nrows(), n_tokens)
            .ok_or_else(|| format!("Voice {voice} has no styles"))?;
        let style_vec: Vec<f32> = styles.row(style_idx).to_vec();

        // 4. Input tensors; speed stays at 1.0, playback rate is applied by the sink
        let tokens_tensor = Tensor::from_array(
            Array2::from_shape_vec((1, n_tokens), token_ids)
                .map_err(|e| format!("Failed to create tokens tensor: {e}"))?,
        )
        .map_err(|e| format!("Failed to create tokens ort tensor: {e}"))?;

        let style_tensor = Tensor::from_array(
            Array2::from_shape_vec((1, 256), style_vec)
                .map_err(|e| format!("Failed to create style tensor: {e}"))?,
        )
        .map_err(|e| format!("Failed to create style ort tensor: {e}"))?;

        let speed_tensor = Tensor::from_array(ndarray::Array1::from_vec(vec![1.0f32]))
            .map_err(|e| format!("Failed to create speed ort tensor: {e}"))?;

        // 5. Inference
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![
                "tokens" => tokens_tensor,
                "style" => style_tensor,
                "speed" => speed_tensor
            ])
            .map_err(|e| format!("ONNX inference failed: {e}"))?;

        let first_output = outputs
            .iter()
            .next()
            .ok_or("No output tensor from model")?;
        let (_shape, audio_slice) = first_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("Failed to extract audio tensor: {e}"))?;

        let samples: Vec<f32> = audio_slice.to_vec();
        debug!(
            "Generated {} samples ({:.1}s)",
            samples.len(),
            samples.len() as f32 / SAMPLE_RATE as f32
        );
        Ok(samples)
    }
}

#[derive(Debug, Clone)]
struct ModelPaths {
    model: PathBuf,
    voices: PathBuf,
    tokenizer: PathBuf,
}

impl ModelPaths {
    fn from_config(config: &NativeConfig) -> Self {
        Self {
            model: PathBuf::from(&config.model_path),
            voices: PathBuf::from(&config.voices_path),
            tokenizer: PathBuf::from(&config.tokenizer_path),
        }
    }

    fn all_exist(&self) -> bool {
        [&self.model, &self.voices, &self.tokenizer]
            .iter()
            .all(|p| p.exists())
    }
}

/// Native Kokoro engine.
pub struct NativeEngine {
    paths: ModelPaths,
    model: OnceLock<Arc<KokoroModel>>,
    output: Arc<AudioOutput>,
}

impl NativeEngine {
    pub fn new(config: &NativeConfig, output: Arc<AudioOutput>) -> Self {
        Self {
            paths: ModelPaths::from_config(config),
            model: OnceLock::new(),
            output,
        }
    }

    /// Model files are on disk and there is somewhere to play audio.
    pub fn is_supported(config: &NativeConfig) -> bool {
        ModelPaths::from_config(config).all_exist() && AudioOutput::device_available()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }
}

#[async_trait]
impl SpeechEngine for NativeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    async fn init(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let paths = self.paths.clone();
        let model = tokio::task::spawn_blocking(move || KokoroModel::load(&paths))
            .await
            .map_err(|e| TtsError::Engine(format!("Model loading task failed: {e}")))??;
        // a concurrent init may have won; either model is fine
        let _ = self.model.set(Arc::new(model));
        Ok(())
    }

    fn voices(&self) -> Vec<Voice> {
        self.model
            .get()
            .map(|m| m.voice_list())
            .unwrap_or_default()
    }

    async fn load(&self, chunk: &PageChunk, settings: &SpeechSettings) -> Result<Box<dyn Utterance>> {
        let leaf_index = chunk.leaf_index;
        let model = self
            .model
            .get()
            .cloned()
            .ok_or_else(|| TtsError::load_failure(leaf_index, "model not loaded"))?;

        let voice = settings
            .voice
            .as_ref()
            .map_or_else(|| DEFAULT_VOICE.to_string(), |v| v.voice_uri.clone());
        let text = chunk.text.clone();

        let t_gen = Instant::now();
        let samples = tokio::task::spawn_blocking(move || model.synthesize(&text, &voice))
            .await
            .map_err(|e| TtsError::load_failure(leaf_index, e.to_string()))?
            .map_err(|e| TtsError::load_failure(leaf_index, e))?;
        debug!(
            "Synthesized page {leaf_index} chunk {} in {}ms",
            chunk.index,
            t_gen.elapsed().as_millis()
        );

        let sink = self.output.paused_sink()?;
        sink.append(SamplesBuffer::new(1, SAMPLE_RATE, samples));
        Ok(Box::new(SinkUtterance::new(sink)))
    }
}

/// `model.vocab` of a tokenizer.json, keyed by each token's first character.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>> {
    let data: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let vocab = data
        .pointer("/model/vocab")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| TtsError::Engine(format!("{}: no model.vocab", path.display())))?;

    vocab
        .iter()
        .filter_map(|(token, id)| token.chars().next().map(|ch| (ch, id)))
        .map(|(ch, id)| {
            id.as_i64()
                .map(|id| (ch, id))
                .ok_or_else(|| TtsError::Engine(format!("token {ch:?} has a non-integer id")))
        })
        .collect()
}

/// Style row for a sequence of `n_tokens` (padding included), clamped to the table.
fn style_index(rows: usize, n_tokens: usize) -> Option<usize> {
    rows.checked_sub(1)
        .map(|last| n_tokens.saturating_sub(2).min(last))
}

fn onnx_error(model: &Path, e: impl std::fmt::Display) -> TtsError {
    TtsError::Engine(format!("ONNX session for {}: {e}", model.display()))
}

fn npz_error(path: &Path, what: &str, e: impl std::fmt::Display) -> TtsError {
    TtsError::Engine(format!("{}: {what}: {e}", path.display()))
}

/// Voice styles from the voices NPZ, reshaped from (510, 1, 256) to (510, 256).
fn load_voices(path: &Path) -> Result<HashMap<String, Array2<f32>>> {
    let mut npz = NpzReader::new(fs::File::open(path)?)
        .map_err(|e| npz_error(path, "not an NPZ archive", e))?;
    let entries = npz
        .names()
        .map_err(|e| npz_error(path, "unreadable entry list", e))?;

    let mut voices = HashMap::with_capacity(entries.len());
    for entry in entries {
        let styles: Array3<f32> = npz.by_name(&entry).map_err(|e| npz_error(path, &entry, e))?;
        let (rows, width) = (styles.shape()[0], styles.shape()[2]);
        let styles = styles
            .into_shape_with_order((rows, width))
            .map_err(|e| npz_error(path, &entry, e))?;
        voices.insert(entry.trim_end_matches(".npy").to_string(), styles);
    }
    Ok(voices)
}

/// Sentences end at `.`, `!` or `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut rest = text;
    while let Some(end) = rest
        .char_indices()
        .zip(rest.chars().skip(1))
        .find(|((_, c), next)| matches!(c, '.' | '!' | '?') && next.is_whitespace())
        .map(|((i, _), _)| i + 1)
    {
        sentences.push(&rest[..end]);
        rest = &rest[end..];
    }
    sentences.push(rest);
    sentences
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
