//! Recursive character text splitter.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters
//! with up to `chunk_overlap` characters shared between neighbours.
//!
//! The text is first cut into atomic pieces: a section that is too long is
//! split on the first separator it contains (markdown headings, then list
//! items, then lines, then sentences), recursing with the remaining
//! separators, and falling back to a hard character split. Pieces are then
//! merged greedily into chunks. Every chunk is a trimmed contiguous span of
//! the original text, so its `char_offset` points back into the document.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::models::{Chunk, Document};

/// Separators in priority order, with the cut position inside each match.
/// Headings and list items start the next piece; a sentence's period stays
/// with the sentence it ends.
const SEPARATORS: &[(&str, usize)] = &[("\n## ", 0), ("\n- ", 0), ("\n", 0), (". ", 1)];

/// Chunk a loaded document.
pub fn chunk_document(doc: &Document, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    chunk_text(&doc.source_id, &doc.text, chunk_size, chunk_overlap)
}

/// Split text into chunks with contiguous indices starting at 0.
///
/// Blank text produces no chunks.
pub fn chunk_text(source_id: &str, text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let chunk_overlap = chunk_overlap.min(chunk_size - 1);

    let mut pieces = Vec::new();
    split_pieces(text, 0, text.len(), SEPARATORS, chunk_size, &mut pieces);
    let spans = merge_pieces(text, &pieces, chunk_size, chunk_overlap);

    let mut chunks = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        let slice = &text[start..end];
        let trimmed = slice.trim();
        if trimmed.is_empty() {
            continue;
        }
        let trimmed_start = start + (slice.len() - slice.trim_start().len());
        let char_offset = text[..trimmed_start].chars().count() as i64;
        chunks.push(make_chunk(source_id, chunks.len() as i64, trimmed, char_offset));
    }

    chunks
}

fn split_pieces(
    text: &str,
    start: usize,
    end: usize,
    separators: &[(&str, usize)],
    max_chars: usize,
    out: &mut Vec<(usize, usize)>,
) {
    if start >= end {
        return;
    }
    let segment = &text[start..end];
    if char_len(segment) <= max_chars {
        out.push((start, end));
        return;
    }

    let Some(pos) = separators.iter().position(|(pat, _)| segment.contains(pat)) else {
        hard_split(text, start, end, max_chars, out);
        return;
    };
    let (pattern, cut) = separators[pos];
    let rest = &separators[pos + 1..];

    let mut piece_start = start;
    for (idx, _) in segment.match_indices(pattern) {
        let split_at = start + idx + cut;
        if split_at > piece_start {
            split_pieces(text, piece_start, split_at, rest, max_chars, out);
            piece_start = split_at;
        }
    }
    split_pieces(text, piece_start, end, rest, max_chars, out);
}

fn hard_split(text: &str, start: usize, end: usize, max_chars: usize, out: &mut Vec<(usize, usize)>) {
    let mut piece_start = start;
    let mut count = 0;
    for (i, _) in text[start..end].char_indices() {
        if count == max_chars {
            out.push((piece_start, start + i));
            piece_start = start + i;
            count = 0;
        }
        count += 1;
    }
    if piece_start < end {
        out.push((piece_start, end));
    }
}

/// Greedily merge contiguous pieces into spans of at most `chunk_size`
/// characters, carrying trailing pieces worth at most `overlap` characters
/// into the next span.
fn merge_pieces(
    text: &str,
    pieces: &[(usize, usize)],
    chunk_size: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut window: VecDeque<(usize, usize, usize)> = VecDeque::new();
    let mut total = 0usize;

    for &(start, end) in pieces {
        let len = char_len(&text[start..end]);

        if total + len > chunk_size {
            if let (Some(first), Some(last)) = (window.front(), window.back()) {
                spans.push((first.0, last.1));
            }
            while total > overlap || (total > 0 && total + len > chunk_size) {
                match window.pop_front() {
                    Some((_, _, l)) => total -= l,
                    None => break,
                }
            }
        }

        window.push_back((start, end, len));
        total += len;
    }

    if let (Some(first), Some(last)) = (window.front(), window.back()) {
        spans.push((first.0, last.1));
    }
    spans
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn make_chunk(source_id: &str, index: i64, text: &str, char_offset: i64) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        source_id: source_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        char_offset,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_offsets_valid(text: &str, chunks: &[Chunk]) {
        for c in chunks {
            let tail: String = text.chars().skip(c.char_offset as usize).collect();
            assert!(
                tail.starts_with(&c.text),
                "chunk {} does not start at its offset",
                c.chunk_index
            );
        }
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("doc.md", "Hello, CPF!", 800, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, CPF!");
        assert_eq!(chunks[0].char_offset, 0);
    }

    #[test]
    fn blank_text_has_no_chunks() {
        assert!(chunk_text("doc.md", "", 800, 100).is_empty());
        assert!(chunk_text("doc.md", " \n\n ", 800, 100).is_empty());
    }

    #[test]
    fn chunks_respect_size_and_are_contiguous() {
        let text = (0..60)
            .map(|i| format!("Sentence number {} about CPF savings.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text("doc.txt", &text, 120, 30);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert!(c.text.chars().count() <= 120, "chunk {} too long", i);
        }
        assert_offsets_valid(&text, &chunks);
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = (0..20)
            .map(|i| format!("Line {} of the retirement guide.", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_text("guide.md", &text, 100, 40);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let a_end = a.char_offset + a.text.chars().count() as i64;
            assert!(b.char_offset < a_end, "chunks {} and {} do not overlap", a.chunk_index, b.chunk_index);
            assert!(b.char_offset > a.char_offset);
        }
        assert_offsets_valid(&text, &chunks);
    }

    #[test]
    fn headings_split_first() {
        let section = "word ".repeat(30);
        let text = format!("## Retirement\n{}\n## Housing\n{}", section, section);
        let chunks = chunk_text("faq.md", &text, 200, 0);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.starts_with("## Retirement"));
        assert!(chunks[1].text.starts_with("## Housing"));
    }

    #[test]
    fn sentences_keep_their_period() {
        let text = "The FRS rises every year. The BRS is half of the FRS. The ERS is double.";
        let chunks = chunk_text("frs.txt", text, 30, 0);
        assert!(chunks.iter().all(|c| !c.text.starts_with('.')));
        assert!(chunks[0].text.ends_with('.'));
    }

    #[test]
    fn long_word_is_hard_split() {
        let text = "x".repeat(250);
        let chunks = chunk_text("blob.txt", &text, 100, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].text.len(), 50);
        assert_eq!(chunks[1].char_offset, 100);
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "公积金".repeat(100);
        let chunks = chunk_text("zh.txt", &text, 50, 5);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 50));
        assert_offsets_valid(&text, &chunks);
    }

    #[test]
    fn deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc", text, 8, 2);
        let c2 = chunk_text("doc", text, 8, 2);
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.char_offset, b.char_offset);
        }
    }
}
