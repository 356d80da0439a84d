//! Playback coordinator: walks the book chunk by chunk, keeping the page,
//! highlight and audio in step.
//!
//! IDLE → STARTING → PLAYING ⇄ PAUSED → STOPPING → IDLE
//!
//! The coordinator runs as one task that owns all playback state. Work that
//! may suspend (page navigation, audio loading, waiting for audio to end)
//! runs in helper tasks that report back through an internal channel, each
//! message carrying the [`Ticket`] of the chunk it belongs to. Anything
//! arriving with a stale ticket is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analytics::{AnalyticsSink, CATEGORY};
use crate::chunk::{ChunkSource, PageChunk};
use crate::config::Config;
use crate::document::{ContainerId, PageText, Viewer};
use crate::engine::{best_voice, clamp_rate, SpeechEngine, SpeechSettings, Utterance, Voice};
use crate::error::{Result, TtsError};
use crate::highlight::{HighlightIndex, Synchronizer};

/// Identifies one chunk of one playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// Source of tickets. Only the newest ticket is current; advancing or
/// invalidating makes every earlier one stale.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn advance(&self) -> Ticket {
        Ticket(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn invalidate(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.0.load(Ordering::SeqCst) == ticket.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Starting,
    Playing,
    Paused,
    Stopping,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Starting => write!(f, "STARTING"),
            Self::Playing => write!(f, "PLAYING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Stopping => write!(f, "STOPPING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    /// Page of the chunk in flight.
    pub leaf_index: Option<usize>,
}

impl PlaybackStatus {
    /// A session is running, paused or not.
    pub fn playing(&self) -> bool {
        !matches!(self.state, PlaybackState::Idle | PlaybackState::Stopping)
    }

    pub fn paused(&self) -> bool {
        self.state == PlaybackState::Paused
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Start { leaf_index: usize },
    /// Audio for this chunk began; its page is showing and highlighted.
    ChunkStarted(PageChunk),
    Pause,
    Resume,
    Stop,
    /// End of the book. Ends the session in place of `Stop`.
    Done,
    VoicesChanged(Vec<Voice>),
    LoadFailed { leaf_index: usize, reason: String },
}

/// Callbacks supplied by the host. All have empty defaults.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Audio for a chunk is being loaded.
    fn on_loading_start(&self) {}

    /// Loading finished, failed, or was abandoned. Always paired with
    /// `on_loading_start`.
    fn on_loading_complete(&self) {}

    fn on_loading_error(&self, _error: &TtsError) {}

    /// Runs after the chunk's page is showing and highlighted, before its
    /// audio starts.
    async fn before_chunk_play(&self, _chunk: &PageChunk) {}

    fn after_chunk_play(&self, _chunk: &PageChunk) {}

    fn on_done(&self) {}
}

pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

pub struct CoordinatorOptions {
    pub hooks: Arc<dyn LifecycleHooks>,
    pub analytics: Option<Arc<dyn AnalyticsSink>>,
    pub rate: f32,
    /// Voice URI that overrides the best match for the book.
    pub voice: Option<String>,
    pub book_language: Option<String>,
    pub user_languages: Vec<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            hooks: Arc::new(NoHooks),
            analytics: None,
            rate: 1.0,
            voice: None,
            book_language: None,
            user_languages: Vec::new(),
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rate: config.playback.rate,
            voice: config.playback.voice.clone(),
            book_language: config.engine.book_language.clone(),
            user_languages: config.playback.user_languages.clone(),
            ..Self::default()
        }
    }
}

enum Command {
    Start { from: usize, total: usize },
    Stop,
    Toggle,
    TogglePlayPause,
    Pause,
    Resume,
    JumpForward,
    JumpBackward,
    SetPlaybackRate(f32),
    SetVoice { uri: String, reply: oneshot::Sender<bool> },
    Voices(oneshot::Sender<Vec<Voice>>),
    Shutdown,
}

enum Internal {
    Prepared {
        ticket: Ticket,
        result: Result<Box<dyn Utterance>>,
    },
    Finished {
        ticket: Ticket,
    },
}

enum Phase {
    Preparing,
    Ready(Arc<dyn Utterance>),
    Failed,
}

/// The one chunk whose `before_chunk_play` has run without a matching
/// completion or stop.
struct InFlight {
    chunk: PageChunk,
    ticket: Ticket,
    phase: Phase,
    started: bool,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Handle for the UI layer. Cheap to clone.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PlaybackStatus>,
    events: broadcast::Sender<PlaybackEvent>,
    sync: Arc<Synchronizer>,
}

impl CoordinatorHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TtsError::Closed)
    }

    /// Read from page `from` of a `total`-page book. Restarts if already playing.
    pub async fn start(&self, from: usize, total: usize) -> Result<()> {
        self.send(Command::Start { from, total }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Start from the viewer's current page when idle, otherwise pause or resume.
    pub async fn toggle(&self) -> Result<()> {
        self.send(Command::Toggle).await
    }

    pub async fn toggle_play_pause(&self) -> Result<()> {
        self.send(Command::TogglePlayPause).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    pub async fn jump_forward(&self) -> Result<()> {
        self.send(Command::JumpForward).await
    }

    pub async fn jump_backward(&self) -> Result<()> {
        self.send(Command::JumpBackward).await
    }

    pub async fn set_playback_rate(&self, rate: f32) -> Result<()> {
        self.send(Command::SetPlaybackRate(rate)).await
    }

    /// Returns false if the engine has no voice with this URI.
    pub async fn set_voice(&self, uri: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetVoice {
            uri: uri.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TtsError::Closed)
    }

    pub async fn voices(&self) -> Result<Vec<Voice>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Voices(reply)).await?;
        rx.await.map_err(|_| TtsError::Closed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    pub fn status(&self) -> PlaybackStatus {
        *self.status.borrow()
    }

    pub fn playing(&self) -> bool {
        self.status().playing()
    }

    pub fn paused(&self) -> bool {
        self.status().paused()
    }

    pub fn watch_status(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Forward the viewer's lazily created page containers.
    pub fn container_created(&self, page: usize, container: ContainerId) {
        self.sync.container_created(page, container);
    }

    pub fn highlights(&self) -> HighlightIndex {
        self.sync.snapshot()
    }
}

pub struct Coordinator {
    engine: Arc<dyn SpeechEngine>,
    text: Arc<dyn PageText>,
    viewer: Arc<dyn Viewer>,
    sync: Arc<Synchronizer>,
    hooks: Arc<dyn LifecycleHooks>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    generation: Generation,
    settings: SpeechSettings,
    preferred_voice: Option<String>,
    book_language: Option<String>,
    user_languages: Vec<String>,
    state: PlaybackState,
    source: Option<ChunkSource>,
    current: Option<InFlight>,
    /// Page whose text could not be read, while halted on it.
    unreadable_page: Option<usize>,
    status: watch::Sender<PlaybackStatus>,
    events: broadcast::Sender<PlaybackEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl Coordinator {
    /// Start the coordinator task. It initializes the engine, then serves
    /// commands until shut down or every handle is dropped.
    pub fn spawn(
        engine: Arc<dyn SpeechEngine>,
        text: Arc<dyn PageText>,
        viewer: Arc<dyn Viewer>,
        options: CoordinatorOptions,
    ) -> CoordinatorHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PlaybackStatus {
            state: PlaybackState::Idle,
            leaf_index: None,
        });
        let (events, _) = broadcast::channel(64);

        let generation = Generation::default();
        let sync = Arc::new(Synchronizer::new(viewer.clone(), generation.clone()));

        let coordinator = Self {
            engine,
            text,
            viewer,
            sync: sync.clone(),
            hooks: options.hooks,
            analytics: options.analytics,
            generation,
            settings: SpeechSettings {
                voice: None,
                rate: clamp_rate(options.rate),
            },
            preferred_voice: options.voice,
            book_language: options.book_language,
            user_languages: options.user_languages,
            state: PlaybackState::Idle,
            source: None,
            current: None,
            unreadable_page: None,
            status: status_tx,
            events: events.clone(),
            internal: internal_tx,
        };
        tokio::spawn(coordinator.run(command_rx, internal_rx));

        CoordinatorHandle {
            commands: command_tx,
            status: status_rx,
            events,
            sync,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.init_engine().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
            }
        }

        self.stop();
        debug!("Coordinator shut down");
    }

    async fn init_engine(&mut self) {
        let kind = self.engine.kind();
        if let Err(e) = self.engine.init().await {
            warn!("Failed to initialize {kind} speech engine: {e}");
            return;
        }

        let voices = self.engine.voices();
        let preferred = self
            .preferred_voice
            .as_deref()
            .and_then(|uri| voices.iter().find(|v| v.voice_uri == uri).cloned());
        self.settings.voice = preferred.or_else(|| {
            best_voice(&voices, self.book_language.as_deref(), &self.user_languages)
        });

        info!(
            "{kind} speech engine ready: {} voice(s), using {}",
            voices.len(),
            self.settings
                .voice
                .as_ref()
                .map_or("engine default", |v| v.voice_uri.as_str())
        );
        self.emit(PlaybackEvent::VoicesChanged(voices));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { from, total } => self.start(from, total).await,
            Command::Stop => self.stop(),
            Command::Toggle => {
                if self.state == PlaybackState::Idle {
                    let (from, total) = (self.viewer.current_index(), self.viewer.num_leafs());
                    self.start(from, total).await;
                } else {
                    self.toggle_play_pause().await;
                }
            }
            Command::TogglePlayPause => self.toggle_play_pause().await,
            Command::Pause => self.pause(),
            Command::Resume => self.resume().await,
            Command::JumpForward => self.jump(Direction::Forward).await,
            Command::JumpBackward => self.jump(Direction::Backward).await,
            Command::SetPlaybackRate(rate) => self.set_playback_rate(rate),
            Command::SetVoice { uri, reply } => {
                let _ = reply.send(self.set_voice(&uri));
            }
            Command::Voices(reply) => {
                let _ = reply.send(self.engine.voices());
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Prepared { ticket, result } => self.on_prepared(ticket, result),
            Internal::Finished { ticket } => self.on_finished(ticket).await,
        }
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            info!("State: {} → {}", self.state, state);
            self.state = state;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status.send_replace(PlaybackStatus {
            state: self.state,
            leaf_index: self.current.as_ref().map(|c| c.chunk.leaf_index),
        });
    }

    fn emit(&self, event: PlaybackEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn track(&self, action: &str, value: Option<f64>, extra: Option<&str>) {
        if let Some(analytics) = &self.analytics {
            analytics.send_event(CATEGORY, action, value, extra);
        }
    }

    async fn start(&mut self, from: usize, total: usize) {
        if self.state != PlaybackState::Idle {
            self.stop();
        }
        info!("Reading from page {} of {total}", from + 1);

        self.source = Some(ChunkSource::new(self.text.clone(), from, total));
        self.unreadable_page = None;
        self.set_state(PlaybackState::Starting);
        self.emit(PlaybackEvent::Start { leaf_index: from });
        self.track("Start", None, None);
        self.advance().await;
    }

    /// Pull the next chunk and begin it, or finish at the end of the book.
    async fn advance(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        match source.next().await {
            Ok(Some(chunk)) => self.begin_chunk(chunk),
            Ok(None) => self.finish(),
            Err(e) => self.halt(e),
        }
    }

    fn begin_chunk(&mut self, chunk: PageChunk) {
        let ticket = self.generation.advance();
        self.unreadable_page = None;
        debug!(
            "Chunk {} of page {}: {} chars",
            chunk.index,
            chunk.leaf_index,
            chunk.text.len()
        );

        self.hooks.on_loading_start();

        let prepare = {
            let engine = self.engine.clone();
            let sync = self.sync.clone();
            let hooks = self.hooks.clone();
            let settings = self.settings.clone();
            let internal = self.internal.clone();
            let chunk = chunk.clone();
            tokio::spawn(async move {
                let present = async {
                    if sync.present(&chunk, ticket).await {
                        hooks.before_chunk_play(&chunk).await;
                    }
                };
                let ((), result) = tokio::join!(present, engine.load(&chunk, &settings));
                let _ = internal.send(Internal::Prepared { ticket, result });
            })
        };

        self.current = Some(InFlight {
            chunk,
            ticket,
            phase: Phase::Preparing,
            started: false,
            tasks: vec![prepare],
        });
        if self.state != PlaybackState::Paused {
            self.set_state(PlaybackState::Starting);
        } else {
            self.publish_status();
        }
    }

    fn on_prepared(&mut self, ticket: Ticket, result: Result<Box<dyn Utterance>>) {
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|c| c.ticket == ticket && matches!(c.phase, Phase::Preparing));
        if !is_current || !self.generation.is_current(ticket) {
            debug!("Discarding audio for a superseded chunk");
            if let Ok(utterance) = result {
                utterance.stop();
            }
            return;
        }

        self.hooks.on_loading_complete();

        let utterance: Arc<dyn Utterance> = match result {
            Ok(utterance) => Arc::from(utterance),
            Err(e) => {
                self.hooks.on_loading_error(&e);
                self.halt(e);
                return;
            }
        };
        utterance.set_rate(self.settings.rate);

        let watcher = {
            let utterance = utterance.clone();
            let internal = self.internal.clone();
            tokio::spawn(async move {
                utterance.finished().await;
                let _ = internal.send(Internal::Finished { ticket });
            })
        };

        let paused = self.state == PlaybackState::Paused;
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.phase = Phase::Ready(utterance.clone());
        current.tasks.push(watcher);

        if paused {
            debug!("Audio ready while paused, holding it");
            return;
        }
        utterance.play();
        current.started = true;
        let chunk = current.chunk.clone();
        self.set_state(PlaybackState::Playing);
        self.emit(PlaybackEvent::ChunkStarted(chunk));
    }

    async fn on_finished(&mut self, ticket: Ticket) {
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|c| c.ticket == ticket && matches!(c.phase, Phase::Ready(_)));
        if !is_current {
            return;
        }
        let Some(done) = self.current.take() else {
            return;
        };
        self.hooks.after_chunk_play(&done.chunk);

        if self.state == PlaybackState::Playing {
            self.advance().await;
        }
    }

    /// Load failure: keep the chunk, stop speaking, wait for resume or jump.
    fn halt(&mut self, error: TtsError) {
        if error.is_retryable() {
            warn!("Playback halted, resume to retry: {error}");
        } else {
            warn!("Playback halted: {error}");
        }
        let leaf_index = match self.current.as_mut() {
            Some(current) => {
                current.phase = Phase::Failed;
                current.chunk.leaf_index
            }
            None => match &error {
                TtsError::PageText { index, .. } => {
                    self.unreadable_page = Some(*index);
                    *index
                }
                _ => self.source.as_ref().map_or(0, |s| s.position().0),
            },
        };
        self.set_state(PlaybackState::Paused);
        self.emit(PlaybackEvent::LoadFailed {
            leaf_index,
            reason: error.to_string(),
        });
    }

    fn pause(&mut self) {
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Starting) {
            return;
        }
        if let Some(InFlight {
            phase: Phase::Ready(utterance),
            ..
        }) = &self.current
        {
            utterance.pause();
        }
        self.set_state(PlaybackState::Paused);
        self.emit(PlaybackEvent::Pause);
        self.track("Pause", None, None);
    }

    async fn resume(&mut self) {
        if self.state != PlaybackState::Paused {
            return;
        }
        self.emit(PlaybackEvent::Resume);
        self.track("Resume", None, None);

        let Some(current) = self.current.as_mut() else {
            // halted before a chunk was produced: try reading again
            self.set_state(PlaybackState::Starting);
            self.advance().await;
            return;
        };

        match &current.phase {
            Phase::Ready(utterance) => {
                utterance.play();
                let first_play = !current.started;
                current.started = true;
                let chunk = current.chunk.clone();
                self.set_state(PlaybackState::Playing);
                if first_play {
                    self.emit(PlaybackEvent::ChunkStarted(chunk));
                }
            }
            Phase::Preparing => self.set_state(PlaybackState::Starting),
            Phase::Failed => {
                info!("Retrying page {}", current.chunk.leaf_index);
                if let Some(chunk) = self.abandon_current() {
                    self.set_state(PlaybackState::Starting);
                    self.begin_chunk(chunk);
                }
            }
        }
    }

    async fn toggle_play_pause(&mut self) {
        match self.state {
            PlaybackState::Paused => self.resume().await,
            PlaybackState::Playing | PlaybackState::Starting => self.pause(),
            PlaybackState::Idle | PlaybackState::Stopping => {}
        }
    }

    async fn jump(&mut self, direction: Direction) {
        if matches!(self.state, PlaybackState::Idle | PlaybackState::Stopping) {
            return;
        }
        if self.state == PlaybackState::Paused {
            self.emit(PlaybackEvent::Resume);
        }

        let had_chunk = self.abandon_current().is_some();
        let unreadable = self.unreadable_page.take();
        self.set_state(PlaybackState::Starting);

        if direction == Direction::Forward {
            if let (Some(page), Some(source)) = (unreadable, self.source.as_mut()) {
                if source.position().0 == page {
                    info!("Skipping unreadable page {page}");
                    source.skip_page();
                }
            }
        } else {
            // the cursor sits after the abandoned chunk
            let steps = if had_chunk { 2 } else { 1 };
            let mut rewound = Ok(());
            if let Some(source) = self.source.as_mut() {
                for _ in 0..steps {
                    rewound = source.decrement().await;
                    if rewound.is_err() {
                        break;
                    }
                }
            }
            if let Err(e) = rewound {
                self.halt(e);
                return;
            }
        }

        self.track(
            match direction {
                Direction::Forward => "JumpForward",
                Direction::Backward => "JumpBackward",
            },
            None,
            None,
        );
        self.advance().await;
    }

    /// Drop the in-flight chunk: silence it, cancel its navigation and
    /// loading, and make its ticket stale.
    fn abandon_current(&mut self) -> Option<PageChunk> {
        let current = self.current.take()?;
        self.generation.invalidate();
        for task in &current.tasks {
            task.abort();
        }
        match &current.phase {
            Phase::Ready(utterance) => utterance.stop(),
            Phase::Preparing => self.hooks.on_loading_complete(),
            Phase::Failed => {}
        }
        Some(current.chunk)
    }

    fn stop(&mut self) {
        if self.teardown() {
            self.emit(PlaybackEvent::Stop);
            self.track("Stop", None, None);
        }
    }

    /// Back to IDLE with nothing in flight and nothing highlighted.
    /// Returns whether a session was running.
    fn teardown(&mut self) -> bool {
        let was_active = self.state != PlaybackState::Idle;
        if was_active {
            self.set_state(PlaybackState::Stopping);
        }

        self.abandon_current();
        self.generation.invalidate();
        self.source = None;
        self.unreadable_page = None;
        self.sync.clear();
        self.set_state(PlaybackState::Idle);
        was_active
    }

    fn finish(&mut self) {
        info!("End of book reached");
        self.teardown();
        self.hooks.on_done();
        self.emit(PlaybackEvent::Done);
        self.track("Done", None, None);
    }

    fn set_playback_rate(&mut self, rate: f32) {
        let rate = clamp_rate(rate);
        self.settings.rate = rate;
        if let Some(InFlight {
            phase: Phase::Ready(utterance),
            ..
        }) = &self.current
        {
            utterance.set_rate(rate);
        }
        info!("Playback rate {rate:.2}x");
        self.track("SetPlaybackRate", Some(f64::from(rate)), None);
    }

    fn set_voice(&mut self, uri: &str) -> bool {
        match self.engine.voices().into_iter().find(|v| v.voice_uri == uri) {
            Some(voice) => {
                info!("Voice changed to: {} ({})", voice.name, voice.lang);
                self.settings.voice = Some(voice);
                self.track("SetVoice", None, Some(uri));
                true
            }
            None => {
                warn!("Unknown voice: {uri}");
                false
            }
        }
    }
}
