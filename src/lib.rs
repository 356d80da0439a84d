//! readaloud-rs: text-to-speech read-aloud for paginated book viewers.
//!
//! The [`coordinator`] walks a book chunk by chunk, bringing each chunk's
//! page into view, highlighting its lines and speaking it through one of
//! the [`engine`] backends.

pub mod analytics;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod engine;
pub mod error;
pub mod highlight;

#[cfg(test)]
mod testing;
