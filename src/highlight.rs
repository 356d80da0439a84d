//! Highlight and scroll synchronization for the chunk being spoken.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::chunk::{LineRect, PageChunk};
use crate::coordinator::{Generation, Ticket};
use crate::document::{ContainerId, ViewMode, Viewer};

/// Overlay layer the highlight boxes are drawn into.
pub const HIGHLIGHT_LAYER: &str = "readaloud-highlight";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighlightBox {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

impl From<&LineRect> for HighlightBox {
    fn from(r: &LineRect) -> Self {
        Self {
            left: r.left,
            right: r.right,
            top: r.top,
            bottom: r.bottom,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollRequest {
    pub leaf_index: usize,
    pub target: HighlightBox,
    pub smooth: bool,
    /// Center the target vertically instead of scrolling the least distance.
    pub center: bool,
}

/// Boxes currently drawn, by page. Only one page is ever populated.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HighlightIndex {
    boxes: BTreeMap<usize, Vec<HighlightBox>>,
}

impl HighlightIndex {
    pub fn get(&self, page: usize) -> Option<&[HighlightBox]> {
        self.boxes.get(&page).map(Vec::as_slice)
    }

    pub fn pages(&self) -> Vec<usize> {
        self.boxes.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    fn set(&mut self, page: usize, boxes: Vec<HighlightBox>) {
        self.boxes.clear();
        self.boxes.insert(page, boxes);
    }

    fn take(&mut self) -> BTreeMap<usize, Vec<HighlightBox>> {
        std::mem::take(&mut self.boxes)
    }
}

/// Brings the page of a chunk into view, highlights its lines and scrolls
/// to them. Every visible effect is checked against the chunk's ticket so a
/// superseded chunk never paints.
pub struct Synchronizer {
    viewer: Arc<dyn Viewer>,
    generation: Generation,
    index: Mutex<HighlightIndex>,
}

impl Synchronizer {
    pub fn new(viewer: Arc<dyn Viewer>, generation: Generation) -> Self {
        Self {
            viewer,
            generation,
            index: Mutex::new(HighlightIndex::default()),
        }
    }

    /// Navigate, highlight, scroll. Returns false if the chunk went stale
    /// along the way; whatever it drew is then left for the stop or the
    /// next chunk to clear.
    pub async fn present(&self, chunk: &PageChunk, ticket: Ticket) -> bool {
        self.show_page(chunk.leaf_index).await;

        if !self.highlight(chunk, ticket) {
            debug!("Chunk on page {} superseded during navigation", chunk.leaf_index);
            return false;
        }
        // stop or jump may land between drawing and scrolling
        if !self.generation.is_current(ticket) {
            return false;
        }
        self.scroll_to(chunk);
        self.generation.is_current(ticket)
    }

    async fn show_page(&self, index: usize) {
        if self.viewer.is_visible(index) {
            return;
        }
        match self.viewer.mode() {
            ViewMode::TwoPage => self.viewer.flip_to(index).await,
            ViewMode::OnePage | ViewMode::Thumbnail => self.viewer.jump_to_index(index),
        }
    }

    /// Replace whatever is highlighted with this chunk's lines.
    pub fn highlight(&self, chunk: &PageChunk, ticket: Ticket) -> bool {
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.generation.is_current(ticket) {
            return false;
        }

        self.erase(&mut index);

        let boxes: Vec<HighlightBox> = chunk.line_rects.iter().map(HighlightBox::from).collect();
        for container in self.viewer.page_containers(chunk.leaf_index) {
            self.viewer.render_boxes(container, HIGHLIGHT_LAYER, &boxes);
        }
        index.set(chunk.leaf_index, boxes);
        true
    }

    fn scroll_to(&self, chunk: &PageChunk) {
        let mode = self.viewer.mode();
        if mode == ViewMode::Thumbnail {
            return;
        }
        let Some(last) = chunk.line_rects.last() else {
            return;
        };

        self.viewer.scroll_into_view(&ScrollRequest {
            leaf_index: chunk.leaf_index,
            target: HighlightBox::from(last),
            smooth: true,
            // one-page mode tracks the current page from its own scroll position
            center: mode == ViewMode::TwoPage,
        });
    }

    pub fn clear(&self) {
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        self.erase(&mut index);
    }

    fn erase(&self, index: &mut HighlightIndex) {
        for page in index.take().into_keys() {
            for container in self.viewer.page_containers(page) {
                self.viewer.render_boxes(container, HIGHLIGHT_LAYER, &[]);
            }
        }
    }

    /// The viewer created a container for `page` (lazy rendering); draw the
    /// current highlight into it if that page is the highlighted one.
    pub fn container_created(&self, page: usize, container: ContainerId) {
        let index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(boxes) = index.get(page) {
            self.viewer.render_boxes(container, HIGHLIGHT_LAYER, boxes);
        }
    }

    pub fn snapshot(&self) -> HighlightIndex {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
