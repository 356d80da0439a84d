//! The host viewer as seen from read-aloud playback.
//!
//! Page text and geometry come in through [`PageText`]; navigation and
//! overlay rendering go out through [`Viewer`]. [`BookFile`] and
//! [`ConsoleViewer`] are the in-process implementations used by the binary.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunk::LineRect;
use crate::error::{Result, TtsError};
use crate::highlight::{HighlightBox, ScrollRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub rect: LineRect,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub lines: Vec<TextLine>,
}

/// Text and geometry extraction for a book's pages.
#[async_trait]
pub trait PageText: Send + Sync {
    /// Paragraphs of the page at `index`, in reading order. A page with no
    /// text returns an empty list, not an error.
    async fn paragraphs(&self, index: usize) -> Result<Vec<Paragraph>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// Single column of pages, scrolled continuously.
    #[default]
    OnePage,
    /// Facing pages, changed with an animated flip.
    TwoPage,
    Thumbnail,
}

impl ViewMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "1up" | "one-page" | "onepage" => Some(Self::OnePage),
            "2up" | "two-page" | "twopage" => Some(Self::TwoPage),
            "thumb" | "thumbnail" => Some(Self::Thumbnail),
            _ => None,
        }
    }
}

/// Navigation and overlay primitives of the host viewer.
#[async_trait]
pub trait Viewer: Send + Sync {
    fn current_index(&self) -> usize;
    fn num_leafs(&self) -> usize;
    fn mode(&self) -> ViewMode;
    fn is_visible(&self, index: usize) -> bool;

    /// Immediate jump, no animation.
    fn jump_to_index(&self, index: usize);

    /// Animated page change; resolves once the new page is showing.
    async fn flip_to(&self, index: usize);

    /// Containers currently rendering the page at `index`.
    fn page_containers(&self, index: usize) -> Vec<ContainerId>;

    /// Replace the boxes drawn in `layer` on a container. An empty slice clears it.
    fn render_boxes(&self, container: ContainerId, layer: &str, boxes: &[HighlightBox]);

    fn scroll_into_view(&self, request: &ScrollRequest);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookPage {
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
}

/// A whole book held in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookFile {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub language: Option<String>,
    pub pages: Vec<BookPage>,
}

// Synthetic layout for plain text books.
const MARGIN: f64 = 40.0;
const LINE_HEIGHT: f64 = 20.0;
const CHAR_WIDTH: f64 = 8.0;

impl BookFile {
    /// Load a `.json` book, or treat anything else as plain text.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let book = if is_json {
            serde_json::from_str(&contents)?
        } else {
            let mut book = Self::from_plain_text(&contents);
            book.title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            book
        };
        info!("Loaded \"{}\" ({} pages)", book.title, book.pages.len());
        Ok(book)
    }

    /// Pages are split on form feeds, paragraphs on blank lines.
    pub fn from_plain_text(text: &str) -> Self {
        let pages = text
            .split('\u{c}')
            .map(|page| {
                let mut paragraphs = Vec::new();
                let mut lines = Vec::new();
                for (row, raw) in page.lines().enumerate() {
                    if raw.trim().is_empty() {
                        if !lines.is_empty() {
                            paragraphs.push(Paragraph {
                                lines: std::mem::take(&mut lines),
                            });
                        }
                        continue;
                    }
                    let top = MARGIN + row as f64 * LINE_HEIGHT;
                    lines.push(TextLine {
                        text: raw.trim_end().to_string(),
                        rect: LineRect {
                            left: MARGIN,
                            bottom: top + LINE_HEIGHT,
                            right: MARGIN + raw.trim_end().chars().count() as f64 * CHAR_WIDTH,
                            top,
                        },
                    });
                }
                if !lines.is_empty() {
                    paragraphs.push(Paragraph { lines });
                }
                BookPage { paragraphs }
            })
            .collect();

        Self {
            title: String::new(),
            language: None,
            pages,
        }
    }
}

#[async_trait]
impl PageText for BookFile {
    async fn paragraphs(&self, index: usize) -> Result<Vec<Paragraph>> {
        self.pages
            .get(index)
            .map(|p| p.paragraphs.clone())
            .ok_or_else(|| TtsError::PageText {
                index,
                reason: format!("book has {} pages", self.pages.len()),
            })
    }
}

const FLIP_ANIMATION: Duration = Duration::from_millis(300);

/// Viewer that only logs what a graphical one would draw.
pub struct ConsoleViewer {
    num_leafs: usize,
    mode: ViewMode,
    current: AtomicUsize,
}

impl ConsoleViewer {
    pub fn new(num_leafs: usize, mode: ViewMode, start: usize) -> Self {
        Self {
            num_leafs,
            mode,
            current: AtomicUsize::new(start.min(num_leafs.saturating_sub(1))),
        }
    }
}

#[async_trait]
impl Viewer for ConsoleViewer {
    fn current_index(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    fn num_leafs(&self) -> usize {
        self.num_leafs
    }

    fn mode(&self) -> ViewMode {
        self.mode
    }

    fn is_visible(&self, index: usize) -> bool {
        let current = self.current_index();
        match self.mode {
            // facing pages: even leaf on the left
            ViewMode::TwoPage => current / 2 == index / 2,
            _ => current == index,
        }
    }

    fn jump_to_index(&self, index: usize) {
        self.current.store(index, Ordering::Relaxed);
        info!("Page {}", index + 1);
    }

    async fn flip_to(&self, index: usize) {
        debug!("Flipping to page {}", index + 1);
        tokio::time::sleep(FLIP_ANIMATION).await;
        self.current.store(index, Ordering::Relaxed);
        info!("Page {}", index + 1);
    }

    fn page_containers(&self, index: usize) -> Vec<ContainerId> {
        if self.is_visible(index) {
            vec![ContainerId(index as u64)]
        } else {
            Vec::new()
        }
    }

    fn render_boxes(&self, container: ContainerId, layer: &str, boxes: &[HighlightBox]) {
        if boxes.is_empty() {
            debug!("Cleared {layer} on container {}", container.0);
        } else {
            debug!("Drew {} box(es) in {layer} on container {}", boxes.len(), container.0);
        }
    }

    fn scroll_into_view(&self, request: &ScrollRequest) {
        debug!(
            "Scroll page {} to y={:.0} (center={})",
            request.leaf_index + 1,
            request.target.top,
            request.center
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_pages_and_paragraphs() {
        let book = BookFile::from_plain_text("One line.\nsecond line.\n\nNew paragraph.\n\u{c}\n\nPage two.");
        assert_eq!(book.pages.len(), 2);
        assert_eq!(book.pages[0].paragraphs.len(), 2);
        assert_eq!(book.pages[0].paragraphs[0].lines.len(), 2);
        assert_eq!(book.pages[1].paragraphs.len(), 1);

        let rect = book.pages[0].paragraphs[0].lines[1].rect;
        assert_eq!(rect.top, MARGIN + LINE_HEIGHT);
        assert_eq!(rect.bottom, rect.top + LINE_HEIGHT);
        assert_eq!(rect.right, MARGIN + 12.0 * CHAR_WIDTH);
    }

    #[test]
    fn json_book_parses() {
        let json = r#"{
            "title": "Sample",
            "language": "de",
            "pages": [
                {"paragraphs": [{"lines": [{"text": "Hallo", "rect": [1, 30, 50, 10]}]}]},
                {}
            ]
        }"#;
        let book: BookFile = serde_json::from_str(json).unwrap();
        assert_eq!(book.language.as_deref(), Some("de"));
        assert_eq!(book.pages.len(), 2);
        assert!(book.pages[1].paragraphs.is_empty());
        assert_eq!(book.pages[0].paragraphs[0].lines[0].rect.bottom, 30.0);
    }

    #[tokio::test]
    async fn out_of_range_page_is_an_error() {
        let book = BookFile::from_plain_text("only page");
        assert_eq!(book.paragraphs(0).await.unwrap().len(), 1);
        assert!(matches!(
            book.paragraphs(3).await,
            Err(TtsError::PageText { index: 3, .. })
        ));
    }

    #[test]
    fn console_viewer_two_page_spreads() {
        let viewer = ConsoleViewer::new(10, ViewMode::TwoPage, 4);
        assert!(viewer.is_visible(4));
        assert!(viewer.is_visible(5));
        assert!(!viewer.is_visible(6));
        assert_eq!(viewer.page_containers(5), vec![ContainerId(5)]);
        assert!(viewer.page_containers(7).is_empty());
    }

    #[test]
    fn view_mode_names() {
        assert_eq!(ViewMode::from_name("2up"), Some(ViewMode::TwoPage));
        assert_eq!(ViewMode::from_name("One-Page"), Some(ViewMode::OnePage));
        assert_eq!(ViewMode::from_name("grid"), None);
    }
}
