//! Speakable chunks and the cursor that walks a book through them.
//!
//! A chunk is one paragraph of one page. The source loads page text lazily,
//! caches a small window of pages around the cursor and skips pages that
//! have nothing to say.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::{PageText, Paragraph, TextLine};
use crate::error::Result;

/// Pages kept in the cache on either side of the cursor.
const CACHE_RADIUS: usize = 2;

/// A text line's bounds as `[left, bottom, right, top]` in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct LineRect {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl From<[f64; 4]> for LineRect {
    fn from([left, bottom, right, top]: [f64; 4]) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }
}

impl From<LineRect> for [f64; 4] {
    fn from(r: LineRect) -> Self {
        [r.left, r.bottom, r.right, r.top]
    }
}

/// One speakable unit, bound to exactly one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageChunk {
    pub text: String,
    pub leaf_index: usize,
    /// Position of this chunk among the chunks of its page.
    pub index: usize,
    pub line_rects: Vec<LineRect>,
}

/// Turn a page's paragraphs into chunks, dropping the ones without text.
pub fn chunks_from_paragraphs(leaf_index: usize, paragraphs: &[Paragraph]) -> Vec<PageChunk> {
    paragraphs
        .iter()
        .filter_map(|p| {
            let text = join_lines(&p.lines);
            (!text.is_empty()).then(|| (text, p.lines.iter().map(|l| l.rect).collect()))
        })
        .enumerate()
        .map(|(index, (text, line_rects))| PageChunk {
            text,
            leaf_index,
            index,
            line_rects,
        })
        .collect()
}

/// Join paragraph lines with spaces, healing words hyphenated across a
/// line break ("exam-" + "ple" → "example").
fn join_lines(lines: &[TextLine]) -> String {
    let mut out = String::new();
    for line in lines {
        let text = line.text.trim();
        if text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            let continues_word = text.chars().next().is_some_and(char::is_lowercase);
            if out.ends_with('-') && continues_word {
                out.pop();
            } else {
                out.push(' ');
            }
        }
        out.push_str(text);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    page: usize,
    /// Next chunk to hand out on `page`.
    chunk: usize,
}

/// Restartable, bidirectional sequence of chunks starting at a page.
pub struct ChunkSource {
    text: Arc<dyn PageText>,
    total_pages: usize,
    cursor: Cursor,
    pages: BTreeMap<usize, Vec<PageChunk>>,
}

impl ChunkSource {
    pub fn new(text: Arc<dyn PageText>, start_page: usize, total_pages: usize) -> Self {
        Self {
            text,
            total_pages,
            cursor: Cursor {
                page: start_page.min(total_pages),
                chunk: 0,
            },
            pages: BTreeMap::new(),
        }
    }

    /// Page and in-page chunk index of the next chunk `next` would return.
    pub fn position(&self) -> (usize, usize) {
        (self.cursor.page, self.cursor.chunk)
    }

    async fn chunk_count(&mut self, page: usize) -> Result<usize> {
        if let Some(chunks) = self.pages.get(&page) {
            return Ok(chunks.len());
        }
        let paragraphs = self.text.paragraphs(page).await?;
        let chunks = chunks_from_paragraphs(page, &paragraphs);
        debug!("Page {page}: {} chunk(s)", chunks.len());
        let count = chunks.len();
        self.pages.insert(page, chunks);
        Ok(count)
    }

    fn prune(&mut self) {
        let page = self.cursor.page;
        self.pages
            .retain(|&p, _| p + CACHE_RADIUS >= page && p <= page + CACHE_RADIUS);
    }

    /// Next chunk, or `None` once the end of the book is reached.
    ///
    /// On error the cursor does not move, so calling again retries.
    pub async fn next(&mut self) -> Result<Option<PageChunk>> {
        loop {
            if self.cursor.page >= self.total_pages {
                self.cursor = Cursor {
                    page: self.total_pages,
                    chunk: 0,
                };
                return Ok(None);
            }

            let page = self.cursor.page;
            let count = self.chunk_count(page).await?;
            if self.cursor.chunk < count {
                let chunk = self.pages[&page][self.cursor.chunk].clone();
                self.cursor.chunk += 1;
                self.prune();
                return Ok(Some(chunk));
            }

            self.cursor = Cursor {
                page: page + 1,
                chunk: 0,
            };
        }
    }

    /// Move the cursor to the start of the following page, leaving the rest
    /// of the current one unread.
    pub fn skip_page(&mut self) {
        self.cursor = Cursor {
            page: (self.cursor.page + 1).min(self.total_pages),
            chunk: 0,
        };
        self.prune();
    }

    /// Step the cursor back by one chunk. Stays put at the start of the book.
    pub async fn decrement(&mut self) -> Result<()> {
        loop {
            if self.cursor.chunk > 0 {
                self.cursor.chunk -= 1;
                return Ok(());
            }
            if self.cursor.page == 0 {
                return Ok(());
            }

            let page = self.cursor.page - 1;
            let count = self.chunk_count(page).await?;
            self.cursor = Cursor { page, chunk: count };
        }
    }
}
