//! Paragraph-accumulation chunker
//!
//! Splits document text on blank-line paragraph boundaries and packs
//! paragraphs into chunks of at most `chunk_size` characters. A single
//! paragraph that alone exceeds the limit is hard-sliced into fixed-size
//! pieces.

use tracing::debug;

/// Split text into chunks of at most `chunk_size` characters.
///
/// Paragraphs (blank-line separated) are accumulated into a running buffer
/// until adding the next one would exceed `chunk_size`, at which point the
/// buffer is flushed as one chunk. An oversized paragraph is sliced into
/// exactly `chunk_size`-character pieces (last piece shorter). If paragraph
/// splitting yields nothing but the text is non-empty, the raw text is
/// sliced naively.
pub fn split_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    debug!(text_len = text.len(), chunk_size, "split_chunks: called");
    if chunk_size == 0 {
        return Vec::new();
    }

    // CRLF documents must hit the same paragraph boundaries as LF ones
    let text = text.replace("\r\n", "\n");

    let mut chunks = Vec::new();
    let mut buffer = String::new();

    for paragraph in paragraphs(&text) {
        let para_len = paragraph.chars().count();

        if para_len > chunk_size {
            if !buffer.is_empty() {
                chunks.push(std::mem::take(&mut buffer));
            }
            chunks.extend(hard_slice(paragraph, chunk_size));
            continue;
        }

        if buffer.is_empty() {
            buffer.push_str(paragraph);
            continue;
        }

        // +2 accounts for the paragraph separator
        if buffer.chars().count() + 2 + para_len > chunk_size {
            chunks.push(std::mem::take(&mut buffer));
            buffer.push_str(paragraph);
        } else {
            buffer.push_str("\n\n");
            buffer.push_str(paragraph);
        }
    }

    if !buffer.is_empty() {
        chunks.push(buffer);
    }

    if chunks.is_empty() && !text.trim().is_empty() {
        debug!("split_chunks: no paragraph chunks, falling back to naive slicing");
        chunks = hard_slice(&text, chunk_size);
    }

    chunks
}

/// Iterate blank-line separated paragraphs, skipping empty ones
fn paragraphs(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n\n").map(str::trim).filter(|p| !p.is_empty())
}

/// Slice text into pieces of exactly `chunk_size` characters (last shorter)
fn hard_slice(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|piece| piece.iter().collect())
        .collect()
}
