//! Overlapping text splitter.
//!
//! Splits message bodies into bounded-size chunks with a configurable
//! overlap so that statements near a boundary appear in both neighbouring
//! chunks. Window boundaries prefer whitespace to avoid cutting words.

/// Character-window splitter with overlap.
#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    chunk_size: usize,
    overlap: usize,
}

impl TextSplitter {
    /// `overlap` must be strictly smaller than `chunk_size`; validated at
    /// config load, asserted here.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        assert!(overlap < chunk_size, "overlap must be < chunk_size");
        Self {
            chunk_size,
            overlap,
        }
    }

    /// Split `text` into ordered chunks. Non-empty input always yields at
    /// least one chunk; empty input yields none.
    pub fn split(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.chunk_size {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let hard_end = (start + self.chunk_size).min(chars.len());
            let end = if hard_end < chars.len() {
                break_point(&chars, start, hard_end)
            } else {
                hard_end
            };

            let chunk: String = chars[start..end].iter().collect();
            let trimmed = chunk.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }

            if end == chars.len() {
                break;
            }
            // Next window starts `overlap` characters before the cut.
            start = end.saturating_sub(self.overlap).max(start + 1);
        }
        chunks
    }
}

/// Prefer the last whitespace inside the window, as long as it keeps the
/// chunk reasonably full.
fn break_point(chars: &[char], start: usize, hard_end: usize) -> usize {
    let window = &chars[start..hard_end];
    match window.iter().rposition(|c| c.is_whitespace()) {
        Some(pos) if pos > window.len() / 2 => start + pos + 1,
        _ => hard_end,
    }
}
