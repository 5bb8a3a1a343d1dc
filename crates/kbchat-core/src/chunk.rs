//! Recursive, separator-aware text chunker.
//!
//! Splits normalized document text into overlapping [`DocumentChunk`]s of at
//! most `chunk_size` characters, preferring the most structural separator
//! that can divide the text.
//!
//! # Algorithm
//!
//! 1. Normalize the text ([`normalize_text`]).
//! 2. Split on the first separator of the preference list. Every separator
//!    stays attached to the start of the piece that follows it, so pieces
//!    are contiguous spans of the normalized text.
//! 3. Pieces still longer than `chunk_size` are split again with the next
//!    separator. The empty separator splits into single characters, which
//!    always fit.
//! 4. Pieces are merged greedily into windows of at most `chunk_size`
//!    characters. After a window is emitted, the next one starts from the
//!    trailing pieces of the previous window whose total length is at most
//!    `chunk_overlap`. When even the last piece is longer than that, the
//!    next window starts with the last `chunk_overlap` characters instead,
//!    so adjacent chunks always share some text.
//!
//! Because windows are contiguous and every piece is covered, chunks
//! re-assembled by their `offset` reproduce the normalized text.
//!
//! # Example
//!
//! ```rust
//! use kbchat_core::chunk::Chunker;
//!
//! let chunker = Chunker::plain(5, 2).unwrap();
//! let chunks = chunker.split("Alpha. Beta. Gamma.", "notes.md");
//! assert!(chunks.len() >= 3);
//! assert!(chunks.iter().all(|c| c.text.chars().count() <= 5));
//! ```

use std::collections::VecDeque;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::DocumentChunk;

/// Separator preferences for markdown: section breaks, paragraphs, lines,
/// markdown hard breaks, words, characters.
pub const MARKDOWN_SEPARATORS: &[&str] = &["\n\n## ", "\n##", "\n#", "\n\n", "\n", "  ", " ", ""];

/// Separator preferences for plain text.
pub const PLAIN_SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// A contiguous byte span of the normalized text and its length in chars.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    chars: usize,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Chunker {
    /// Build a chunker with an explicit separator list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `chunk_size` is zero or
    /// `chunk_overlap` is not smaller than `chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize, separators: Vec<String>) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Validation("chunk_size must be > 0".to_string()));
        }
        if chunk_overlap >= chunk_size {
            return Err(Error::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators,
        })
    }

    pub fn markdown(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        Self::new(chunk_size, chunk_overlap, to_owned(MARKDOWN_SEPARATORS))
    }

    pub fn plain(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        Self::new(chunk_size, chunk_overlap, to_owned(PLAIN_SEPARATORS))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split `text` into overlapping chunks tagged with `source`.
    ///
    /// Returns an empty vector when nothing remains after normalization.
    /// Chunks carry contiguous `sequence_hint`s starting at 0.
    pub fn split(&self, text: &str, source: &str) -> Vec<DocumentChunk> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Vec::new();
        }

        let mut spans = Vec::new();
        self.split_spans(&normalized, 0, normalized.len(), 0, &mut spans);
        let windows = self.merge(&normalized, &spans);

        let mut chunks = Vec::with_capacity(windows.len());
        let mut cursor_byte = 0usize;
        let mut cursor_char = 0usize;
        for (start, end) in windows {
            cursor_char += normalized[cursor_byte..start].chars().count();
            cursor_byte = start;

            let piece = &normalized[start..end];
            if piece.trim().is_empty() {
                continue;
            }
            let index = chunks.len() as i64;
            chunks.push(make_chunk(source, index, cursor_char, piece));
        }
        chunks
    }

    fn split_spans(&self, text: &str, start: usize, end: usize, level: usize, out: &mut Vec<Span>) {
        let piece = &text[start..end];
        let chars = piece.chars().count();
        if chars <= self.chunk_size {
            out.push(Span { start, end, chars });
            return;
        }

        let sep = match self.separators.get(level) {
            Some(sep) if !sep.is_empty() => sep.as_str(),
            _ => {
                split_chars(piece, start, out);
                return;
            }
        };

        let cuts: Vec<usize> = piece
            .match_indices(sep)
            .map(|(i, _)| start + i)
            .filter(|&i| i > start)
            .collect();
        if cuts.is_empty() {
            self.split_spans(text, start, end, level + 1, out);
            return;
        }

        let mut piece_start = start;
        for cut in cuts.into_iter().chain(std::iter::once(end)) {
            if cut > piece_start {
                self.split_spans(text, piece_start, cut, level + 1, out);
            }
            piece_start = cut;
        }
    }

    /// Merge spans into windows, returning byte ranges of the normalized text.
    fn merge(&self, text: &str, spans: &[Span]) -> Vec<(usize, usize)> {
        let mut windows = Vec::new();
        let mut queue: VecDeque<Span> = spans.iter().copied().collect();
        let mut window: VecDeque<Span> = VecDeque::new();
        let mut total = 0usize;

        while let Some(span) = queue.pop_front() {
            if total + span.chars > self.chunk_size {
                if let (Some(first), Some(last)) = (window.front().copied(), window.back().copied()) {
                    windows.push((first.start, last.end));
                    let emitted = total;
                    while total > self.chunk_overlap
                        || (total + span.chars > self.chunk_size && total > 0)
                    {
                        match window.pop_front() {
                            Some(dropped) => total -= dropped.chars,
                            None => break,
                        }
                    }

                    // No whole piece fits the overlap: carry a partial tail
                    // of the emitted window instead.
                    if window.is_empty() && self.chunk_overlap > 0 {
                        let room = self.chunk_size - span.chars;
                        let keep = match room {
                            0 => self.chunk_overlap.min(emitted),
                            room => self.chunk_overlap.min(emitted).min(room),
                        };
                        window.push_back(tail_span(text, last.end, keep));
                        total = keep;

                        if total + span.chars > self.chunk_size {
                            let (head, rest) = split_span(text, span, self.chunk_size - total);
                            queue.push_front(rest);
                            window.push_back(head);
                            total += head.chars;
                            continue;
                        }
                    }
                }
            }
            window.push_back(span);
            total += span.chars;
        }

        if let (Some(first), Some(last)) = (window.front(), window.back()) {
            windows.push((first.start, last.end));
        }
        windows
    }
}

/// The last `chars` characters of `text[..end]`.
fn tail_span(text: &str, end: usize, chars: usize) -> Span {
    let start = text[..end]
        .char_indices()
        .rev()
        .nth(chars.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    Span { start, end, chars }
}

/// Split `span` after its first `head_chars` characters.
fn split_span(text: &str, span: Span, head_chars: usize) -> (Span, Span) {
    let mid = text[span.start..span.end]
        .char_indices()
        .nth(head_chars)
        .map_or(span.end, |(i, _)| span.start + i);
    (
        Span {
            start: span.start,
            end: mid,
            chars: head_chars,
        },
        Span {
            start: mid,
            end: span.end,
            chars: span.chars - head_chars,
        },
    )
}

fn to_owned(separators: &[&str]) -> Vec<String> {
    separators.iter().map(|s| s.to_string()).collect()
}

fn split_chars(piece: &str, base: usize, out: &mut Vec<Span>) {
    for (i, c) in piece.char_indices() {
        out.push(Span {
            start: base + i,
            end: base + i + c.len_utf8(),
            chars: 1,
        });
    }
}

/// Normalize document text before chunking.
///
/// Converts CRLF and lone CR to LF, drops control characters other than
/// `\n` and `\t`, collapses three or more consecutive newlines into two,
/// and trims surrounding whitespace.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(text.len());
    let mut newline_run = 0usize;

    for c in text.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(c);
            }
            continue;
        }
        if c.is_control() && c != '\t' {
            continue;
        }
        newline_run = 0;
        out.push(c);
    }

    out.trim().to_string()
}

fn make_chunk(source: &str, index: i64, offset: usize, text: &str) -> DocumentChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    DocumentChunk {
        id: Uuid::new_v4().to_string(),
        source: source.to_string(),
        sequence_hint: Some(index),
        offset,
        text: text.to_string(),
        hash,
    }
}
