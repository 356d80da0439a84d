//! rodio output shared by the speech engines.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rodio::cpal::traits::HostTrait;
use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tracing::info;

use super::Utterance;
use crate::error::{Result, TtsError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default output device, opened on first use and kept for the process lifetime.
pub struct AudioOutput {
    stream: Mutex<Option<OutputStream>>,
}

impl Default for AudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput {
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }

    pub fn device_available() -> bool {
        rodio::cpal::default_host().default_output_device().is_some()
    }

    /// A new sink on the output, paused and empty.
    pub fn paused_sink(&self) -> Result<Sink> {
        let mut guard = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let stream = OutputStreamBuilder::open_default_stream()
                .map_err(|e| TtsError::Engine(format!("Failed to open audio output: {e}")))?;
            info!("Audio output opened");
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_ref() else {
            return Err(TtsError::Engine("Audio output unavailable".into()));
        };

        let sink = Sink::connect_new(stream.mixer());
        sink.pause();
        Ok(sink)
    }
}

/// One chunk's audio queued on its own sink.
pub struct SinkUtterance {
    sink: Sink,
}

impl SinkUtterance {
    pub fn new(sink: Sink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Utterance for SinkUtterance {
    fn play(&self) {
        self.sink.play();
    }

    fn pause(&self) {
        self.sink.pause();
    }

    fn stop(&self) {
        self.sink.stop();
    }

    fn set_rate(&self, rate: f32) {
        self.sink.set_speed(rate);
    }

    async fn finished(&self) {
        while !self.sink.empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
