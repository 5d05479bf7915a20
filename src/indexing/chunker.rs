//! Boundary-aware, overlapping text chunker.
//!
//! A document is cut into contiguous pieces using the largest boundary that
//! keeps each piece within the window body (markdown sections, then
//! paragraphs, sentences, words and finally raw characters). Adjacent pieces
//! are merged back up to the body size, and every merged block is emitted as
//! a window that also carries the `overlap` characters preceding it.
//!
//! Offsets and lengths count characters, not bytes.

use super::loader::Document;
use pulldown_cmark::{Event, Parser, Tag};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Range;

/// A bounded slice of a document, the unit of embedding and retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Stable id derived from `(source_path, start_offset)`
    pub id: String,
    pub source_path: String,
    /// Character offset of the first character within the document
    pub start_offset: usize,
    pub text: String,
    /// Length in characters
    pub length: usize,
    /// SHA-256 of `text`, used to detect unchanged fragments
    pub content_hash: String,
    /// Embedding, attached after the provider has run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl Fragment {
    pub fn new(source_path: &str, start_offset: usize, text: String) -> Self {
        Self {
            id: fragment_id(source_path, start_offset),
            source_path: source_path.to_string(),
            start_offset,
            length: text.chars().count(),
            content_hash: content_hash(&text),
            text,
            vector: None,
        }
    }

    /// Character range covered by this fragment
    pub fn range(&self) -> Range<usize> {
        self.start_offset..self.start_offset + self.length
    }
}

/// Deterministic fragment id for a source path and character offset
pub fn fragment_id(source_path: &str, start_offset: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_path.as_bytes());
    hasher.update([0u8]);
    hasher.update((start_offset as u64).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a fragment's text
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Boundaries tried from largest to smallest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Section,
    Paragraph,
    Sentence,
    Word,
    Character,
}

impl Boundary {
    fn finer(self) -> Self {
        match self {
            Boundary::Section => Boundary::Paragraph,
            Boundary::Paragraph => Boundary::Sentence,
            Boundary::Sentence => Boundary::Word,
            Boundary::Word | Boundary::Character => Boundary::Character,
        }
    }
}

/// Maps between character indices and byte offsets of one text
struct CharIndex<'a> {
    text: &'a str,
    /// Byte offset of every character, plus `text.len()` as a sentinel
    bytes: Vec<usize>,
}

impl<'a> CharIndex<'a> {
    fn new(text: &'a str) -> Self {
        let mut bytes: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bytes.push(text.len());
        Self { text, bytes }
    }

    fn len(&self) -> usize {
        self.bytes.len() - 1
    }

    fn slice(&self, range: &Range<usize>) -> &'a str {
        &self.text[self.bytes[range.start]..self.bytes[range.end]]
    }

    /// Character index of a byte offset that lies on a char boundary
    fn char_at(&self, byte: usize) -> usize {
        match self.bytes.binary_search(&byte) {
            Ok(i) => i,
            Err(i) => i,
        }
    }
}

/// Split a document into overlapping fragments of at most `max_size` characters.
///
/// Expects `max_size > 0` and `overlap < max_size`; other values are clamped.
pub fn split(document: &Document, max_size: usize, overlap: usize) -> Vec<Fragment> {
    let text = document.text.as_str();
    if text.is_empty() {
        return Vec::new();
    }

    let max_size = max_size.max(1);
    let overlap = overlap.min(max_size - 1);
    let source = document.source();
    let index = CharIndex::new(text);
    let total = index.len();

    if total <= max_size {
        return vec![Fragment::new(&source, 0, text.to_string())];
    }

    let body = max_size - overlap;
    let sections = section_starts(&index);

    let mut pieces = Vec::new();
    split_range(&index, &sections, 0..total, Boundary::Section, body, &mut pieces);
    let blocks = merge_pieces(pieces, body);

    windows(&blocks, overlap)
        .into_iter()
        .map(|range| Fragment::new(&source, range.start, index.slice(&range).to_string()))
        .collect()
}

/// Character offsets at which markdown headings start
fn section_starts(index: &CharIndex) -> Vec<usize> {
    let mut starts: Vec<usize> = Parser::new(index.text)
        .into_offset_iter()
        .filter_map(|(event, range)| match event {
            Event::Start(Tag::Heading { .. }) => Some(index.char_at(range.start)),
            _ => None,
        })
        .collect();
    starts.sort_unstable();
    starts.dedup();
    starts
}

/// Recursively cut `range` into contiguous pieces of at most `body` characters
fn split_range(
    index: &CharIndex,
    sections: &[usize],
    range: Range<usize>,
    boundary: Boundary,
    body: usize,
    out: &mut Vec<Range<usize>>,
) {
    if range.len() <= body {
        if !range.is_empty() {
            out.push(range);
        }
        return;
    }

    if boundary == Boundary::Character {
        let mut start = range.start;
        while start < range.end {
            let end = (start + body).min(range.end);
            out.push(start..end);
            start = end;
        }
        return;
    }

    let cuts = cut_points(index, sections, &range, boundary);
    if cuts.is_empty() {
        split_range(index, sections, range, boundary.finer(), body, out);
        return;
    }

    let mut start = range.start;
    for cut in cuts.into_iter().chain(std::iter::once(range.end)) {
        split_range(index, sections, start..cut, boundary.finer(), body, out);
        start = cut;
    }
}

/// Boundary positions strictly inside `range`, ascending
fn cut_points(
    index: &CharIndex,
    sections: &[usize],
    range: &Range<usize>,
    boundary: Boundary,
) -> Vec<usize> {
    let inside = |c: &usize| *c > range.start && *c < range.end;
    let base = index.bytes[range.start];
    let slice = index.slice(range);

    let mut cuts: Vec<usize> = match boundary {
        Boundary::Section => sections.iter().copied().filter(inside).collect(),
        Boundary::Paragraph => slice
            .match_indices("\n\n")
            .map(|(i, m)| index.char_at(base + i + m.len()))
            .collect(),
        Boundary::Sentence => {
            let mut cuts = Vec::new();
            let mut chars = slice.char_indices().peekable();
            while let Some((_, ch)) = chars.next() {
                if matches!(ch, '.' | '!' | '?') {
                    if let Some(&(i, next)) = chars.peek() {
                        if next.is_whitespace() {
                            cuts.push(index.char_at(base + i + next.len_utf8()));
                        }
                    }
                }
            }
            cuts
        }
        Boundary::Word => {
            let mut cuts = Vec::new();
            let mut prev_space = false;
            for (i, ch) in slice.char_indices() {
                let space = ch.is_whitespace();
                if prev_space && !space {
                    cuts.push(index.char_at(base + i));
                }
                prev_space = space;
            }
            cuts
        }
        Boundary::Character => Vec::new(),
    };

    cuts.retain(inside);
    cuts.dedup();
    cuts
}

/// Greedily join adjacent pieces while the joined span fits in `body`
fn merge_pieces(pieces: Vec<Range<usize>>, body: usize) -> Vec<Range<usize>> {
    let mut blocks: Vec<Range<usize>> = Vec::new();
    for piece in pieces {
        match blocks.last_mut() {
            Some(last) if piece.end - last.start <= body => last.end = piece.end,
            _ => blocks.push(piece),
        }
    }
    blocks
}

/// Extend each block backwards by `overlap` characters.
///
/// A window that would start at or before its predecessor covers it
/// entirely, so the predecessor is dropped.
fn windows(blocks: &[Range<usize>], overlap: usize) -> Vec<Range<usize>> {
    let mut windows: Vec<Range<usize>> = Vec::with_capacity(blocks.len());
    for block in blocks {
        let start = block.start.saturating_sub(overlap);
        while windows.last().map_or(false, |prev| prev.start >= start) {
            windows.pop();
        }
        windows.push(start..block.end);
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Document {
        Document::new("/corpus/doc.md", text)
    }

    fn assert_invariants(text: &str, fragments: &[Fragment], max_size: usize, overlap: usize) {
        let chars: Vec<char> = text.chars().collect();
        assert_eq!(fragments[0].start_offset, 0);
        assert_eq!(fragments.last().unwrap().range().end, chars.len());
        for f in fragments {
            assert!(f.length <= max_size, "fragment of {} chars exceeds {}", f.length, max_size);
            let expected: String = chars[f.range()].iter().collect();
            assert_eq!(f.text, expected);
        }
        for pair in fragments.windows(2) {
            assert_eq!(pair[0].range().end - pair[1].start_offset, overlap);
        }
    }

    #[test]
    fn test_empty_document_has_no_fragments() {
        assert!(split(&doc(""), 100, 10).is_empty());
    }

    #[test]
    fn test_short_document_is_single_fragment() {
        let text = "# Title\n\nShort body.";
        let fragments = split(&doc(text), 100, 10);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].start_offset, 0);
        assert_eq!(fragments[0].text, text);
        assert_eq!(fragments[0].length, text.chars().count());
    }

    #[test]
    fn test_document_of_exactly_max_size_is_single_fragment() {
        let text = "a".repeat(50);
        let fragments = split(&doc(&text), 50, 10);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, text);
    }

    #[test]
    fn test_long_document_respects_size_and_overlap() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} talks about governance rules.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let fragments = split(&doc(&text), 200, 40);
        assert!(fragments.len() > 2);
        assert_invariants(&text, &fragments, 200, 40);
    }

    #[test]
    fn test_sections_are_preferred_cut_points() {
        let section = |name: &str| format!("## {}\n\n{}\n\n", name, "word ".repeat(12));
        let text = format!("{}{}{}", section("One"), section("Two"), section("Three"));
        let fragments = split(&doc(&text), 90, 10);
        assert_invariants(&text, &fragments, 90, 10);
        // Every window body ends right before a heading or at the end.
        for f in &fragments[..fragments.len() - 1] {
            let rest: String = text.chars().skip(f.range().end).collect();
            assert!(rest.starts_with("## "), "cut not at a section: {:?}", rest);
        }
    }

    #[test]
    fn test_unbroken_text_falls_back_to_characters() {
        let text = "x".repeat(1000);
        let fragments = split(&doc(&text), 100, 20);
        assert_invariants(&text, &fragments, 100, 20);
        assert_eq!(fragments[1].start_offset, 60);
    }

    #[test]
    fn test_zero_overlap_produces_disjoint_fragments() {
        let text = "Alpha beta gamma. ".repeat(30);
        let fragments = split(&doc(&text), 64, 0);
        assert_invariants(&text, &fragments, 64, 0);
    }

    #[test]
    fn test_multibyte_offsets_are_characters() {
        let text = "┌──┐ é ü ß 漢字 ".repeat(40);
        let fragments = split(&doc(&text), 50, 5);
        assert_invariants(&text, &fragments, 50, 5);
    }

    #[test]
    fn test_short_leading_block_is_absorbed() {
        // "# T\n\n" is shorter than the overlap, so the window after it covers it.
        let text = format!("# T\n\n{}", "x".repeat(200));
        let fragments = split(&doc(&text), 60, 20);
        assert_invariants(&text, &fragments, 60, 20);
        assert_eq!(fragments[0].range(), 0..45);
        assert_eq!(fragments[1].start_offset, 25);
    }

    #[test]
    fn test_deterministic_ids_and_text() {
        let text = "Alpha.\n\nBeta gamma delta.\n\nEpsilon zeta eta theta.".repeat(10);
        let a = split(&doc(&text), 80, 16);
        let b = split(&doc(&text), 80, 16);
        assert_eq!(a, b);
        assert_eq!(a[0].id, fragment_id("/corpus/doc.md", 0));
    }

    #[test]
    fn test_fragment_id_depends_on_source_and_offset() {
        assert_ne!(fragment_id("a.md", 0), fragment_id("b.md", 0));
        assert_ne!(fragment_id("a.md", 0), fragment_id("a.md", 1));
        assert_eq!(fragment_id("a.md", 7).len(), 64);
    }

    #[test]
    fn test_out_of_range_overlap_is_clamped() {
        let text = "word ".repeat(50);
        let fragments = split(&doc(&text), 20, 50);
        assert_invariants(&text, &fragments, 20, 19);
    }
}
