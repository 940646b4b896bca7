use crate::error::IngestError;
use crate::models::{DocumentChunk, IngestionOptions};
use std::collections::VecDeque;
use tracing::debug;

/// Separators tried in priority order. The empty separator splits into
/// single characters and is always the last resort.
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 100,
        }
    }
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            chunk_overlap: value.chunk_overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

pub fn chunk_document(
    source: &str,
    text: &str,
    config: ChunkingConfig,
) -> Result<Vec<DocumentChunk>, IngestError> {
    config.validate()?;

    Ok(split_text(text, config)
        .into_iter()
        .enumerate()
        .map(|(index, text)| DocumentChunk {
            text,
            source: source.to_string(),
            chunk_index: index as u64,
            checksum: None,
        })
        .collect())
}

/// Splits text on the highest-priority separator it contains, merging small
/// pieces up to `chunk_size` characters and recursing into pieces that are
/// still too large.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let mut chunks = Vec::new();
    if text.is_empty() {
        return chunks;
    }
    split_recursive(text, &SEPARATORS, config, &mut chunks);
    chunks
}

fn split_recursive(
    text: &str,
    separators: &[&'static str],
    config: ChunkingConfig,
    out: &mut Vec<String>,
) {
    let (separator, remaining) = pick_separator(text, separators);
    let mut pending: Vec<&str> = Vec::new();

    for piece in split_keeping_separator(text, separator) {
        if char_len(piece) < config.chunk_size {
            pending.push(piece);
            continue;
        }

        if !pending.is_empty() {
            merge_pieces(&pending, config, out);
            pending.clear();
        }

        if remaining.is_empty() {
            push_trimmed(piece, out);
        } else {
            split_recursive(piece, remaining, config, out);
        }
    }

    if !pending.is_empty() {
        merge_pieces(&pending, config, out);
    }
}

fn pick_separator<'a>(
    text: &str,
    separators: &'a [&'static str],
) -> (&'static str, &'a [&'static str]) {
    for (position, separator) in separators.iter().enumerate() {
        if separator.is_empty() {
            return ("", &[]);
        }
        if text.contains(separator) {
            return (separator, &separators[position + 1..]);
        }
    }
    ("", &[])
}

/// The separator stays attached to the start of the piece that follows it.
fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(start, ch)| &text[start..start + ch.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (index, _) in text.match_indices(separator) {
        if index > start {
            pieces.push(&text[start..index]);
        }
        start = index;
    }
    pieces.push(&text[start..]);
    pieces.retain(|piece| !piece.is_empty());
    pieces
}

fn merge_pieces(pieces: &[&str], config: ChunkingConfig, out: &mut Vec<String>) {
    let mut window: VecDeque<(&str, usize)> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let length = char_len(piece);

        if total + length > config.chunk_size {
            if total > config.chunk_size {
                debug!(
                    total,
                    chunk_size = config.chunk_size,
                    "merged chunk exceeds chunk size"
                );
            }

            if !window.is_empty() {
                push_joined(&window, out);

                // Keep a tail of at most `chunk_overlap` characters as the head
                // of the next chunk.
                while total > config.chunk_overlap
                    || (total + length > config.chunk_size && total > 0)
                {
                    match window.pop_front() {
                        Some((_, dropped)) => total -= dropped,
                        None => break,
                    }
                }
            }
        }

        window.push_back((piece, length));
        total += length;
    }

    push_joined(&window, out);
}

fn push_joined(window: &VecDeque<(&str, usize)>, out: &mut Vec<String>) {
    let joined: String = window.iter().map(|(piece, _)| *piece).collect();
    push_trimmed(&joined, out);
}

fn push_trimmed(text: &str, out: &mut Vec<String>) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
