//! Sliding-window text chunker.
//!
//! Splits canonical document text into overlapping [`Chunk`]s measured in
//! whitespace-delimited tokens. Each chunk records the byte span it covers
//! in the source so that [`reassemble`] can undo the overlap and reproduce
//! the input exactly.
//!
//! # Algorithm
//!
//! 1. Tokenize on Unicode whitespace, remembering each token's byte span.
//! 2. Emit windows of `chunk_size` tokens, advancing by
//!    `chunk_size - overlap` tokens, until a window reaches the last token.
//! 3. If the trailing window holds fewer than `min_chunk_size` tokens and
//!    is not the only window, fold it into its predecessor.
//! 4. Widen spans so that no byte is left uncovered: the first chunk starts
//!    at 0, the last ends at `text.len()`, and with zero overlap a chunk
//!    runs up to the start of the next one.
//!
//! # Example
//!
//! ```rust
//! use docrag_core::chunk::split;
//!
//! let chunks = split("A B C D", 2, 1, 1).unwrap();
//! let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(texts, vec!["A B", "B C", "C D"]);
//! ```

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::Chunk;

/// Split text into overlapping token windows.
///
/// # Guarantees
///
/// - Chunks are ordered and their ordinals are `0..N`.
/// - Consecutive chunks share exactly `overlap` tokens.
/// - Every chunk but the last holds exactly `chunk_size` tokens; the last
///   holds at most `chunk_size + min_chunk_size - 1`.
/// - No chunk holds fewer than `min_chunk_size` tokens unless it is the
///   only chunk.
/// - [`reassemble`] of the result equals `text` whenever `text` contains at
///   least one token. Token-free text yields no chunks.
///
/// # Errors
///
/// [`Error::Validation`] when `chunk_size == 0`, `overlap >= chunk_size`,
/// or `min_chunk_size > chunk_size`.
pub fn split(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(Error::Validation("chunk_size must be > 0".to_string()));
    }
    if overlap >= chunk_size {
        return Err(Error::Validation(format!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap, chunk_size
        )));
    }
    if min_chunk_size > chunk_size {
        return Err(Error::Validation(format!(
            "min_chunk_size ({}) must not exceed chunk_size ({})",
            min_chunk_size, chunk_size
        )));
    }

    let tokens = token_spans(text);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let n = tokens.len();
    let stride = chunk_size - overlap;
    let mut windows: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(n);
        windows.push((start, end));
        if end == n {
            break;
        }
        start += stride;
    }

    if windows.len() > 1 {
        let (tail_start, tail_end) = windows[windows.len() - 1];
        if tail_end - tail_start < min_chunk_size {
            windows.pop();
            if let Some(last) = windows.last_mut() {
                last.1 = n;
            }
        }
    }

    let mut chunks = Vec::with_capacity(windows.len());
    for (i, &(first, last_excl)) in windows.iter().enumerate() {
        let span_start = if i == 0 { 0 } else { tokens[first].0 };
        let span_end = match windows.get(i + 1) {
            Some(&(next_first, _)) => tokens[last_excl - 1].1.max(tokens[next_first].0),
            None => text.len(),
        };
        chunks.push(make_chunk(
            i,
            &text[span_start..span_end],
            span_start,
            span_end,
            last_excl - first,
        ));
    }

    Ok(chunks)
}

/// Rebuild the source text from chunks produced by [`split`].
///
/// Overlapping bytes are taken once, from the earlier chunk.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;
    for chunk in chunks {
        if chunk.end <= covered && !out.is_empty() {
            continue;
        }
        let skip = covered.saturating_sub(chunk.start);
        out.push_str(&chunk.text[skip..]);
        covered = chunk.end;
    }
    out
}

/// Byte spans `(start, end)` of whitespace-delimited tokens.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut current: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = current.take() {
                spans.push((s, i));
            }
        } else if current.is_none() {
            current = Some(i);
        }
    }
    if let Some(s) = current {
        spans.push((s, text.len()));
    }
    spans
}

fn make_chunk(ordinal: usize, text: &str, start: usize, end: usize, token_count: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        ordinal,
        text: text.to_string(),
        start,
        end,
        token_count,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    const SAMPLE: &str = "  The quick brown fox\njumps over the lazy dog.\n\nÉtoile  filante — ünïcode tokens\tand tabs  \n";

    #[test]
    fn test_scenario_two_by_one() {
        let chunks = split("A B C D", 2, 1, 1).unwrap();
        assert_eq!(texts(&chunks), vec!["A B", "B C", "C D"]);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i);
            assert_eq!(c.token_count, 2);
        }
    }

    #[test]
    fn test_reassemble_reconstructs_for_all_configurations() {
        for chunk_size in 1..=8 {
            for overlap in 0..chunk_size {
                for min in 0..=chunk_size {
                    let chunks = split(SAMPLE, chunk_size, overlap, min).unwrap();
                    assert_eq!(
                        reassemble(&chunks),
                        SAMPLE,
                        "size={} overlap={} min={}",
                        chunk_size,
                        overlap,
                        min
                    );
                }
            }
        }
    }

    #[test]
    fn test_spans_are_contiguous() {
        let chunks = split(SAMPLE, 3, 0, 0).unwrap();
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, SAMPLE.len());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "zero overlap leaves no gap");
        }
    }

    #[test]
    fn test_overlap_is_exact() {
        let text = (0..40).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let chunks = split(&text, 7, 3, 2).unwrap();
        for pair in chunks.windows(2) {
            let a: Vec<&str> = pair[0].text.split_whitespace().collect();
            let b: Vec<&str> = pair[1].text.split_whitespace().collect();
            assert_eq!(&a[a.len() - 3..], &b[..3]);
        }
    }

    #[test]
    fn test_sizes_and_minimum() {
        let text = (0..23).map(|i| format!("t{}", i)).collect::<Vec<_>>().join(" ");
        // stride 4: windows start at 0,4,...,20 -> last window [20,23) has 3 tokens
        let chunks = split(&text, 5, 1, 3).unwrap();
        let (last, rest) = chunks.split_last().unwrap();
        for c in rest {
            assert_eq!(c.token_count, 5);
        }
        assert!(last.token_count >= 3);
        assert!(last.token_count < 5 + 3);
    }

    #[test]
    fn test_short_tail_is_folded() {
        // windows [0,4),[3,7),[6,8) -> tail has 2 tokens < 3, folded into [3,8)
        let text = "a b c d e f g h";
        let chunks = split(text, 4, 1, 3).unwrap();
        assert_eq!(texts(&chunks), vec!["a b c d", "d e f g h"]);
        assert_eq!(chunks[1].token_count, 5);
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_single_short_chunk_allowed() {
        let chunks = split("only two", 10, 2, 5).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "only two");
    }

    #[test]
    fn test_empty_and_blank_text() {
        assert!(split("", 4, 1, 1).unwrap().is_empty());
        assert!(split(" \n\t ", 4, 1, 1).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(split("a", 0, 0, 0), Err(Error::Validation(_))));
        assert!(matches!(split("a", 2, 2, 0), Err(Error::Validation(_))));
        assert!(matches!(split("a", 2, 1, 3), Err(Error::Validation(_))));
    }

    #[test]
    fn test_deterministic_hashes() {
        let a = split(SAMPLE, 4, 1, 1).unwrap();
        let b = split(SAMPLE, 4, 1, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].hash.len(), 64);
    }
}
