//! Overlapping text chunking with pre-splitting for oversized documents

use crate::config::IngestionConfig;
use crate::error::{ChunkError, Result};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// A contiguous piece of a document, positioned in original char offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub index: usize,
}

/// Stable chunk id derived from the file sha and chunk index
pub fn stable_chunk_id(source_id: &str, file_sha: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b":");
    hasher.update(file_sha.as_bytes());
    hasher.update(b":");
    hasher.update(index.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 content hash used as the file sha where the source has none
pub fn content_sha(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Sliding-window chunker with overlap and boundary snapping
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
    pre_split_threshold: usize,
    section_deadline: Duration,
}

impl TextChunker {
    pub fn new(
        chunk_size: usize,
        overlap: usize,
        min_chunk_size: usize,
        pre_split_threshold: usize,
        section_deadline: Duration,
    ) -> Self {
        debug_assert!(overlap < chunk_size);
        Self {
            chunk_size,
            overlap,
            min_chunk_size,
            pre_split_threshold,
            section_deadline,
        }
    }

    pub fn from_config(config: &IngestionConfig) -> Self {
        Self::new(
            config.chunk_size,
            config.chunk_overlap,
            config.min_chunk_size,
            config.pre_split_threshold,
            Duration::from_secs(config.chunk_timeout_secs),
        )
    }

    /// Chunk a document into ordered overlapping pieces.
    ///
    /// Documents above the pre-split threshold are first divided into
    /// sections at most `pre_split_threshold` chars long; each section is
    /// chunked under its own deadline and indexes are renumbered globally.
    pub fn chunk(&self, text: &str) -> Result<Vec<ChunkPiece>> {
        if text.is_empty() {
            return Ok(vec![]);
        }

        // Char offsets; slicing maps through the byte-offset table so a
        // multi-byte code point can never be split.
        let byte_offsets: Vec<usize> = text
            .char_indices()
            .map(|(byte, _)| byte)
            .chain(std::iter::once(text.len()))
            .collect();
        let chars: Vec<char> = text.chars().collect();

        let sections = self.split_sections(&chars);

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for (section_start, section_end) in sections {
            let deadline = Instant::now() + self.section_deadline;
            self.chunk_section(&chars, section_start, section_end, deadline, &mut ranges)?;
        }

        // Drop undersized pieces unless the document produced a single one.
        // A short piece whose text is not covered by earlier pieces must
        // stay, or reassembly would lose it.
        if ranges.len() > 1 {
            let mut covered_to = 0usize;
            ranges.retain(|(start, end)| {
                let keep = end - start >= self.min_chunk_size || *end > covered_to;
                if keep {
                    covered_to = covered_to.max(*end);
                }
                keep
            });
        }

        let pieces = ranges
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| ChunkPiece {
                text: text[byte_offsets[start]..byte_offsets[end]].to_string(),
                start_char: start,
                end_char: end,
                index,
            })
            .collect();

        Ok(pieces)
    }

    /// Divide the document into sections of at most `pre_split_threshold`
    /// chars, cutting at the closest earlier paragraph break, line break, or
    /// space, with a hard cut as the last resort.
    fn split_sections(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let len = chars.len();
        if len <= self.pre_split_threshold {
            return vec![(0, len)];
        }

        let mut sections = Vec::new();
        let mut start = 0;

        while start < len {
            if len - start <= self.pre_split_threshold {
                sections.push((start, len));
                break;
            }

            let limit = start + self.pre_split_threshold;
            let cut = self
                .find_paragraph_cut(chars, start, limit)
                .or_else(|| self.find_char_cut(chars, start, limit, '\n'))
                .or_else(|| self.find_char_cut(chars, start, limit, ' '))
                .unwrap_or(limit);

            sections.push((start, cut));
            start = cut;
        }

        sections
    }

    /// Latest position `cut <= limit` such that `chars[cut-2..cut]` is "\n\n"
    fn find_paragraph_cut(&self, chars: &[char], start: usize, limit: usize) -> Option<usize> {
        let mut i = limit;
        while i > start + 1 {
            if chars[i - 1] == '\n' && chars[i - 2] == '\n' {
                return Some(i);
            }
            i -= 1;
        }
        None
    }

    /// Latest position `cut <= limit` such that `chars[cut-1]` equals `target`
    fn find_char_cut(
        &self,
        chars: &[char],
        start: usize,
        limit: usize,
        target: char,
    ) -> Option<usize> {
        let mut i = limit;
        while i > start {
            if chars[i - 1] == target {
                return Some(i);
            }
            i -= 1;
        }
        None
    }

    /// Chunk one section with the sliding window, appending char ranges
    fn chunk_section(
        &self,
        chars: &[char],
        section_start: usize,
        section_end: usize,
        deadline: Instant,
        out: &mut Vec<(usize, usize)>,
    ) -> Result<()> {
        let advance = self.chunk_size - self.overlap;
        let mut start = section_start;

        loop {
            if Instant::now() >= deadline {
                return Err(ChunkError::Timeout {
                    elapsed_ms: self.section_deadline.as_millis() as u64,
                }
                .into());
            }

            let ideal_end = (start + self.chunk_size).min(section_end);
            let end = if ideal_end < section_end {
                self.snap_boundary(chars, ideal_end, (ideal_end + self.overlap).min(section_end))
            } else {
                ideal_end
            };

            out.push((start, end));

            if end >= section_end {
                break;
            }
            start += advance;
            if start >= section_end {
                break;
            }
        }

        Ok(())
    }

    /// Extend a window end to the nearest boundary within the lookahead:
    /// sentence terminator, paragraph break, line break, or space.
    fn snap_boundary(&self, chars: &[char], from: usize, limit: usize) -> usize {
        for i in from..limit {
            match chars[i] {
                '.' | '!' | '?' | '\n' | ' ' => return i + 1,
                _ => {}
            }
        }
        from
    }
}

/// Reassemble chunked text by removing overlap, using char offsets.
///
/// Pieces must be in index order. Used by tests to assert the partition
/// property; exposed for diagnostic tooling.
pub fn reassemble(pieces: &[ChunkPiece]) -> String {
    let mut result = String::new();
    let mut covered_to = 0usize;

    for piece in pieces {
        if piece.end_char <= covered_to {
            continue;
        }
        let skip_chars = covered_to.saturating_sub(piece.start_char);
        let mut iter = piece.text.chars();
        for _ in 0..skip_chars {
            iter.next();
        }
        result.extend(iter);
        covered_to = piece.end_char;
    }

    result
}
