//! In-memory stand-ins for the viewer, the page text and a speech engine.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::chunk::{LineRect, PageChunk};
use crate::coordinator::LifecycleHooks;
use crate::document::{ContainerId, PageText, Paragraph, TextLine, ViewMode, Viewer};
use crate::engine::{EngineKind, SpeechEngine, SpeechSettings, Utterance, Voice};
use crate::error::{Result, TtsError};
use crate::highlight::{HighlightBox, ScrollRequest};

const RECT: [f64; 4] = [10.0, 40.0, 200.0, 20.0];

pub fn chunk_on(page: usize, text: &str) -> PageChunk {
    PageChunk {
        text: text.into(),
        leaf_index: page,
        index: 0,
        line_rects: vec![LineRect::from(RECT)],
    }
}

/// Shared, ordered log of what the fakes did.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Book whose pages hold one single-line paragraph per string.
pub struct FakePages {
    pages: Vec<Vec<String>>,
    failing: Mutex<HashSet<usize>>,
}

impl FakePages {
    pub fn new(pages: Vec<Vec<&str>>) -> Self {
        Self {
            pages: pages
                .into_iter()
                .map(|p| p.into_iter().map(String::from).collect())
                .collect(),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_page(&self, index: usize) {
        self.failing.lock().unwrap().insert(index);
    }

    pub fn heal_page(&self, index: usize) {
        self.failing.lock().unwrap().remove(&index);
    }
}

#[async_trait]
impl PageText for FakePages {
    async fn paragraphs(&self, index: usize) -> Result<Vec<Paragraph>> {
        if self.failing.lock().unwrap().contains(&index) {
            return Err(TtsError::PageText {
                index,
                reason: "text layer unavailable".into(),
            });
        }
        let Some(page) = self.pages.get(index) else {
            return Ok(Vec::new());
        };
        Ok(page
            .iter()
            .map(|text| Paragraph {
                lines: vec![TextLine {
                    text: text.clone(),
                    rect: LineRect::from(RECT),
                }],
            })
            .collect())
    }
}

#[derive(Default)]
struct ViewerState {
    all_visible: bool,
    deferred: HashSet<usize>,
    added: HashMap<usize, Vec<ContainerId>>,
    owners: HashMap<ContainerId, usize>,
    drawn: HashMap<ContainerId, Vec<HighlightBox>>,
    flips: Vec<usize>,
    scrolls: Vec<ScrollRequest>,
    next_container: u64,
}

pub struct FakeViewer {
    num_leafs: usize,
    mode: ViewMode,
    current: AtomicUsize,
    state: Mutex<ViewerState>,
    flip_gate: watch::Sender<bool>,
    scrolls_blocked: AtomicBool,
    journal: Journal,
}

impl FakeViewer {
    pub fn new(num_leafs: usize, mode: ViewMode, current: usize) -> Self {
        Self {
            num_leafs,
            mode,
            current: AtomicUsize::new(current),
            state: Mutex::new(ViewerState {
                next_container: 1000,
                ..ViewerState::default()
            }),
            flip_gate: watch::channel(false).0,
            scrolls_blocked: AtomicBool::new(false),
            journal: Journal::default(),
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Every page counts as on screen, so presenting never navigates.
    pub fn show_all_pages(&self) {
        self.state.lock().unwrap().all_visible = true;
    }

    /// The page gets no container until `add_container`.
    pub fn defer_containers(&self, page: usize) {
        self.state.lock().unwrap().deferred.insert(page);
    }

    pub fn add_container(&self, page: usize) -> ContainerId {
        let mut state = self.state.lock().unwrap();
        let id = ContainerId(state.next_container);
        state.next_container += 1;
        state.added.entry(page).or_default().push(id);
        state.owners.insert(id, page);
        id
    }

    /// Flips started while blocked don't complete until unblocked.
    pub fn block_flips(&self, blocked: bool) {
        self.flip_gate.send_replace(blocked);
    }

    /// Scrolls are recorded, then hold the calling thread until unblocked.
    /// Only usable from multi-threaded runtimes.
    pub fn block_scrolls(&self, blocked: bool) {
        self.scrolls_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Pages with boxes drawn in at least one container.
    pub fn highlighted_pages(&self) -> Vec<usize> {
        let state = self.state.lock().unwrap();
        let pages: BTreeSet<usize> = state
            .drawn
            .iter()
            .filter(|(_, boxes)| !boxes.is_empty())
            .map(|(id, _)| state.owners.get(id).copied().unwrap_or(id.0 as usize))
            .collect();
        pages.into_iter().collect()
    }

    pub fn scrolls(&self) -> Vec<ScrollRequest> {
        self.state.lock().unwrap().scrolls.clone()
    }

    pub fn flips(&self) -> Vec<usize> {
        self.state.lock().unwrap().flips.clone()
    }
}

#[async_trait]
impl Viewer for FakeViewer {
    fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn num_leafs(&self) -> usize {
        self.num_leafs
    }

    fn mode(&self) -> ViewMode {
        self.mode
    }

    fn is_visible(&self, index: usize) -> bool {
        if self.state.lock().unwrap().all_visible {
            return true;
        }
        let current = self.current_index();
        match self.mode {
            ViewMode::TwoPage => current / 2 == index / 2,
            _ => current == index,
        }
    }

    fn jump_to_index(&self, index: usize) {
        self.journal.push(format!("jump {index}"));
        self.current.store(index, Ordering::SeqCst);
    }

    async fn flip_to(&self, index: usize) {
        self.state.lock().unwrap().flips.push(index);
        self.journal.push(format!("flip {index}"));
        let mut gate = self.flip_gate.subscribe();
        let _ = gate.wait_for(|blocked| !blocked).await;
        self.current.store(index, Ordering::SeqCst);
    }

    fn page_containers(&self, index: usize) -> Vec<ContainerId> {
        let state = self.state.lock().unwrap();
        let mut containers = Vec::new();
        if !state.deferred.contains(&index) {
            containers.push(ContainerId(index as u64));
        }
        if let Some(added) = state.added.get(&index) {
            containers.extend(added);
        }
        containers
    }

    fn render_boxes(&self, container: ContainerId, _layer: &str, boxes: &[HighlightBox]) {
        let mut state = self.state.lock().unwrap();
        let page = state
            .owners
            .get(&container)
            .copied()
            .unwrap_or(container.0 as usize);
        if !boxes.is_empty() {
            self.journal.push(format!("highlight {page}"));
        }
        state.drawn.insert(container, boxes.to_vec());
    }

    fn scroll_into_view(&self, request: &ScrollRequest) {
        self.state.lock().unwrap().scrolls.push(request.clone());
        while self.scrolls_blocked.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

struct UtteranceState {
    leaf_index: usize,
    journal: Journal,
    plays: AtomicUsize,
    pauses: AtomicUsize,
    stopped: AtomicBool,
    rate: Mutex<f32>,
    done: watch::Sender<bool>,
}

/// Audio that plays until the test says it is done.
#[derive(Clone)]
pub struct FakeUtterance(Arc<UtteranceState>);

impl FakeUtterance {
    fn new(leaf_index: usize, journal: Journal) -> Self {
        Self(Arc::new(UtteranceState {
            leaf_index,
            journal,
            plays: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            rate: Mutex::new(1.0),
            done: watch::channel(false).0,
        }))
    }

    pub fn plays(&self) -> usize {
        self.0.plays.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.0.pauses.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.0.stopped.load(Ordering::SeqCst)
    }

    pub fn rate(&self) -> f32 {
        *self.0.rate.lock().unwrap()
    }

    fn complete(&self) {
        self.0.done.send_replace(true);
    }
}

#[async_trait]
impl Utterance for FakeUtterance {
    fn play(&self) {
        self.0.plays.fetch_add(1, Ordering::SeqCst);
        self.0.journal.push(format!("play {}", self.0.leaf_index));
    }

    fn pause(&self) {
        self.0.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
        self.complete();
    }

    fn set_rate(&self, rate: f32) {
        *self.0.rate.lock().unwrap() = rate;
    }

    async fn finished(&self) {
        let mut done = self.0.done.subscribe();
        let _ = done.wait_for(|d| *d).await;
    }
}

/// Engine with two English voices that records every load.
pub struct FakeEngine {
    journal: Journal,
    loads: Mutex<Vec<(usize, Option<String>)>>,
    utterances: Mutex<Vec<FakeUtterance>>,
    failing: Mutex<HashSet<usize>>,
    load_gate: watch::Sender<bool>,
}

impl FakeEngine {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            loads: Mutex::new(Vec::new()),
            utterances: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            load_gate: watch::channel(false).0,
        }
    }

    pub fn fail_page(&self, page: usize) {
        self.failing.lock().unwrap().insert(page);
    }

    pub fn heal_page(&self, page: usize) {
        self.failing.lock().unwrap().remove(&page);
    }

    /// Loads started while blocked don't return until unblocked.
    pub fn block_loads(&self, blocked: bool) {
        self.load_gate.send_replace(blocked);
    }

    pub fn loaded_pages(&self) -> Vec<usize> {
        self.loads.lock().unwrap().iter().map(|(page, _)| *page).collect()
    }

    pub fn loaded_voices(&self) -> Vec<Option<String>> {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .map(|(_, voice)| voice.clone())
            .collect()
    }

    pub fn utterance_count(&self) -> usize {
        self.utterances.lock().unwrap().len()
    }

    pub fn utterance(&self, n: usize) -> FakeUtterance {
        self.utterances.lock().unwrap()[n].clone()
    }

    /// The most recent utterance plays out.
    pub fn finish_current(&self) {
        if let Some(last) = self.utterances.lock().unwrap().last() {
            last.complete();
        }
    }
}

#[async_trait]
impl SpeechEngine for FakeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    fn voices(&self) -> Vec<Voice> {
        vec![
            Voice {
                voice_uri: "us".into(),
                lang: "en-US".into(),
                name: "American".into(),
                default: true,
            },
            Voice {
                voice_uri: "gb".into(),
                lang: "en-GB".into(),
                name: "British".into(),
                default: false,
            },
        ]
    }

    async fn load(&self, chunk: &PageChunk, settings: &SpeechSettings) -> Result<Box<dyn Utterance>> {
        self.loads.lock().unwrap().push((
            chunk.leaf_index,
            settings.voice.as_ref().map(|v| v.voice_uri.clone()),
        ));

        let mut gate = self.load_gate.subscribe();
        let _ = gate.wait_for(|blocked| !blocked).await;

        if self.failing.lock().unwrap().contains(&chunk.leaf_index) {
            return Err(TtsError::load_failure(chunk.leaf_index, "synthesis failed"));
        }
        let utterance = FakeUtterance::new(chunk.leaf_index, self.journal.clone());
        self.utterances.lock().unwrap().push(utterance.clone());
        Ok(Box::new(utterance))
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    loading_started: AtomicUsize,
    loading_completed: AtomicUsize,
    loading_errors: AtomicUsize,
    before_chunk: AtomicUsize,
    after_chunk: AtomicUsize,
    done: AtomicUsize,
}

impl RecordingHooks {
    pub fn loading_started(&self) -> usize {
        self.loading_started.load(Ordering::SeqCst)
    }

    pub fn loading_completed(&self) -> usize {
        self.loading_completed.load(Ordering::SeqCst)
    }

    pub fn loading_errors(&self) -> usize {
        self.loading_errors.load(Ordering::SeqCst)
    }

    pub fn before_chunk(&self) -> usize {
        self.before_chunk.load(Ordering::SeqCst)
    }

    pub fn after_chunk(&self) -> usize {
        self.after_chunk.load(Ordering::SeqCst)
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LifecycleHooks for RecordingHooks {
    fn on_loading_start(&self) {
        self.loading_started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_loading_complete(&self) {
        self.loading_completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_loading_error(&self, _error: &TtsError) {
        self.loading_errors.fetch_add(1, Ordering::SeqCst);
    }

    async fn before_chunk_play(&self, _chunk: &PageChunk) {
        self.before_chunk.fetch_add(1, Ordering::SeqCst);
    }

    fn after_chunk_play(&self, _chunk: &PageChunk) {
        self.after_chunk.fetch_add(1, Ordering::SeqCst);
    }

    fn on_done(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}
