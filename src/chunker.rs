//! Overlap-aware text chunker.
//!
//! Splits document content into bounded, offset-tracked chunks. When a
//! chunk boundary would fall mid-text, the splitter searches backward from
//! the boundary for the best separator (paragraph break, newline, sentence
//! end, space — in that priority order) so chunks end on natural seams.
//! Consecutive chunks overlap by a configurable amount to mitigate context
//! loss at chunk edges.
//!
//! Offsets are byte offsets into the original text, snapped to UTF-8
//! character boundaries.

use crate::config::ChunkingConfig;

/// A bounded substring of the original text with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// Chunk text, trimmed of boundary whitespace.
    pub content: String,
    /// Zero-based, contiguous sequence index within the document.
    pub index: usize,
    /// Byte offset of `content` within the original text.
    pub start_char: usize,
    /// Byte offset one past the end of `content`.
    pub end_char: usize,
}

/// Split `text` into chunks according to `opts`.
///
/// Text at or under `max_chunk_size` is returned as a single chunk spanning
/// the whole range. Longer text is walked forward; each window ends at the
/// latest occurrence of the highest-priority separator found in the back
/// half of the window, or at the hard size boundary when no separator
/// appears. The next window starts `overlap` bytes before the previous end;
/// when that would not advance (dense separator-free text with a large
/// overlap), the start is forced to the previous end to guarantee progress.
pub fn chunk_text(text: &str, opts: &ChunkingConfig) -> Vec<TextChunk> {
    if text.len() <= opts.max_chunk_size {
        return vec![TextChunk {
            content: text.to_string(),
            index: 0,
            start_char: 0,
            end_char: text.len(),
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < text.len() {
        let mut end = floor_boundary(text, (start + opts.max_chunk_size).min(text.len()));
        if end <= start {
            end = ceil_boundary(text, start + 1);
        }

        if end < text.len() {
            // Search the back half of the window for the latest occurrence
            // of each separator, highest priority first.
            let mid = ceil_boundary(text, start + (end - start) / 2);
            for sep in &opts.separators {
                if let Some(pos) = text[mid..end].rfind(sep.as_str()) {
                    end = mid + pos + sep.len();
                    break;
                }
            }
        }

        let raw = &text[start..end];
        let leading = raw.len() - raw.trim_start().len();
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            chunks.push(TextChunk {
                content: trimmed.to_string(),
                index,
                start_char: start + leading,
                end_char: start + leading + trimmed.len(),
            });
            index += 1;
        }

        if end >= text.len() {
            break;
        }

        let mut next = floor_boundary(text, end.saturating_sub(opts.overlap));
        if next <= start {
            // Degenerate case: the overlap back-step would revisit the
            // previous window. Force forward progress.
            next = end;
        }
        start = next;
    }

    chunks
}

/// Largest char boundary <= `pos`.
fn floor_boundary(text: &str, pos: usize) -> usize {
    let mut p = pos.min(text.len());
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}

/// Smallest char boundary >= `pos`.
fn ceil_boundary(text: &str, pos: usize) -> usize {
    let mut p = pos.min(text.len());
    while p < text.len() && !text.is_char_boundary(p) {
        p += 1;
    }
    p
}
