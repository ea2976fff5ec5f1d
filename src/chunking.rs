//! Chunking and normalization of snippet content.
//!
//! `chunk` is a pure function: identical input always yields the identical
//! chunk sequence, which is what makes replayed ingestion events idempotent
//! further down the pipeline. Content is split on structural boundaries
//! (function/class starts detected per language) up to a size limit, with a
//! sliding-window fallback that overlaps adjacent windows to preserve local
//! context at split points.

use regex::Regex;
use std::sync::LazyLock;

use crate::config::ChunkingConfig;
use crate::types::{Chunk, ChunkIndex, SnippetId, TextSpan};

static PYTHON_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(async\s+def\s|def\s|class\s)").expect("valid boundary pattern")
});

static RUST_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(pub(\([^)]*\))?\s+)?(async\s+)?(fn\s|struct\s|enum\s|trait\s|impl\s|mod\s)")
        .expect("valid boundary pattern")
});

static CURLY_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(export\s+)?(default\s+)?(public\s+|private\s+|protected\s+|static\s+)*(async\s+)?(function\s|class\s|interface\s|func\s|void\s|const\s+\w+\s*=)",
    )
    .expect("valid boundary pattern")
});

static GENERIC_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(async\s+def\s|def\s|class\s|(pub\s+)?(async\s+)?fn\s|func\s|(export\s+)?(async\s+)?function\s|struct\s|interface\s|impl\s|trait\s)",
    )
    .expect("valid boundary pattern")
});

fn boundary_pattern(language_hint: Option<&str>) -> &'static Regex {
    match language_hint.map(|l| l.to_ascii_lowercase()).as_deref() {
        Some("py" | "python") => &PYTHON_BOUNDARY,
        Some("rs" | "rust") => &RUST_BOUNDARY,
        Some(
            "js" | "ts" | "jsx" | "tsx" | "javascript" | "typescript" | "java" | "cs" | "c#"
            | "go" | "cpp" | "c",
        ) => &CURLY_BOUNDARY,
        _ => &GENERIC_BOUNDARY,
    }
}

/// Normalizes raw snippet content: CRLF/CR to LF, trailing whitespace-only
/// content to the empty string. Chunk spans index into this normalized form,
/// so callers persist the normalized content alongside the chunks.
#[must_use]
pub fn normalize(content: &str) -> String {
    let unified = content.replace("\r\n", "\n").replace('\r', "\n");
    if unified.trim().is_empty() {
        String::new()
    } else {
        unified
    }
}

/// Splits normalized snippet content into embeddable chunks.
///
/// Empty or whitespace-only content yields an empty sequence, not an error.
#[must_use]
pub fn chunk(
    snippet_id: &SnippetId,
    content: &str,
    language_hint: Option<&str>,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let normalized = normalize(content);
    if normalized.is_empty() {
        return Vec::new();
    }

    let max = config.max_chunk_bytes.max(1);
    let overlap = config.overlap_bytes.min(max.saturating_sub(1));

    // Cut the text at structural boundaries, then greedily merge adjacent
    // segments so tiny declarations don't each become their own chunk.
    let cuts = boundary_cuts(&normalized, language_hint);
    let blocks = merge_segments(&normalized, &cuts, max);

    let mut chunks = Vec::new();
    for (start, end) in blocks {
        if normalized[start..end].trim().is_empty() {
            continue;
        }
        if end - start <= max {
            push_chunk(&mut chunks, snippet_id, &normalized, start, end);
        } else {
            // No structural boundary inside the limit: fixed-size windows
            // with overlap to keep context across the split.
            for (w_start, w_end) in windows(&normalized, start, end, max, overlap) {
                push_chunk(&mut chunks, snippet_id, &normalized, w_start, w_end);
            }
        }
    }
    chunks
}

fn push_chunk(chunks: &mut Vec<Chunk>, snippet_id: &SnippetId, text: &str, start: usize, end: usize) {
    let index = ChunkIndex(chunks.len() as u32);
    chunks.push(Chunk {
        snippet_id: snippet_id.clone(),
        index,
        span: TextSpan::new(start, end),
        text: text[start..end].to_string(),
    });
}

/// Byte offsets where a new structural block begins, always including 0.
fn boundary_cuts(text: &str, language_hint: Option<&str>) -> Vec<usize> {
    let mut cuts = vec![0];
    for m in boundary_pattern(language_hint).find_iter(text) {
        if m.start() > 0 {
            cuts.push(m.start());
        }
    }
    cuts.push(text.len());
    cuts.dedup();
    cuts
}

/// Merges consecutive boundary-delimited segments into blocks no larger
/// than `max` where possible; oversized single segments pass through for
/// window splitting.
fn merge_segments(text: &str, cuts: &[usize], max: usize) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut block_start: Option<usize> = None;
    for pair in cuts.windows(2) {
        let (seg_start, seg_end) = (pair[0], pair[1]);
        match block_start {
            None => block_start = Some(seg_start),
            Some(start) if seg_end - start > max => {
                blocks.push((start, seg_start));
                block_start = Some(seg_start);
            }
            Some(_) => {}
        }
    }
    if let Some(start) = block_start {
        if start < text.len() {
            blocks.push((start, text.len()));
        }
    }
    blocks
}

/// Fixed-size sliding windows over `[start, end)`, each at most `max` bytes,
/// adjacent windows sharing `overlap` bytes. Window edges land on UTF-8
/// character boundaries.
fn windows(
    text: &str,
    start: usize,
    end: usize,
    max: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut w_start = start;
    loop {
        let mut w_end = (w_start + max).min(end);
        while w_end < end && !text.is_char_boundary(w_end) {
            w_end -= 1;
        }
        if w_end <= w_start {
            // Pathological max smaller than one character; take the character.
            w_end = w_start + 1;
            while w_end < end && !text.is_char_boundary(w_end) {
                w_end += 1;
            }
        }
        out.push((w_start, w_end));
        if w_end >= end {
            break;
        }
        let mut next = w_end.saturating_sub(overlap).max(w_start + 1);
        while next > w_start + 1 && !text.is_char_boundary(next) {
            next -= 1;
        }
        if !text.is_char_boundary(next) {
            next = w_end;
        }
        w_start = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(name: &str) -> SnippetId {
        SnippetId::new(name).unwrap()
    }

    fn cfg(max: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_chunk_bytes: max,
            overlap_bytes: overlap,
        }
    }

    #[test]
    fn empty_content_yields_no_chunks() {
        let config = ChunkingConfig::default();
        assert!(chunk(&sid("a"), "", Some("python"), &config).is_empty());
        assert!(chunk(&sid("a"), "   \n\t\n", None, &config).is_empty());
    }

    #[test]
    fn small_snippet_is_one_chunk() {
        let config = ChunkingConfig::default();
        let content = "def add(a,b): return a+b";
        let chunks = chunk(&sid("add.py"), content, Some("python"), &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, content);
        assert_eq!(chunks[0].span, TextSpan::new(0, content.len()));
        assert_eq!(chunks[0].index, ChunkIndex(0));
    }

    #[test]
    fn chunking_is_deterministic() {
        let config = cfg(64, 16);
        let content = "def a():\n    return 1\n\ndef b():\n    return 2\n\ndef c():\n    return 3\n";
        let first = chunk(&sid("x.py"), content, Some("python"), &config);
        let second = chunk(&sid("x.py"), content, Some("python"), &config);
        assert_eq!(first, second);
    }

    #[test]
    fn splits_on_function_boundaries() {
        let config = cfg(40, 8);
        let content = "def first():\n    return 1\n\ndef second():\n    return 2\n";
        let chunks = chunk(&sid("two.py"), content, Some("python"), &config);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.contains("first"));
        assert!(chunks.last().unwrap().text.contains("second"));
        // Boundary split means no window overlap between the two functions.
        assert!(chunks[0].span.end <= chunks[1].span.start);
    }

    #[test]
    fn oversized_block_falls_back_to_overlapping_windows() {
        let config = cfg(50, 10);
        // One long function body with no inner boundaries.
        let content = format!("def big():\n{}", "    x = x + 1\n".repeat(20));
        let chunks = chunk(&sid("big.py"), &content, Some("python"), &config);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(pair[0].span.end > pair[1].span.start, "windows must overlap");
            assert!(pair[0].span.len() <= 50);
        }
        // Full coverage: last window reaches the end of content.
        assert_eq!(chunks.last().unwrap().span.end, content.len());
    }

    #[test]
    fn normalizes_crlf_line_endings() {
        let config = ChunkingConfig::default();
        let chunks = chunk(&sid("w.rs"), "fn a() {}\r\nfn b() {}\r\n", Some("rust"), &config);
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].text.contains('\r'));
    }

    #[test]
    fn window_edges_respect_utf8() {
        let config = cfg(10, 2);
        let content = "émoji 🦀 content λ spanning multiple windows ß";
        let chunks = chunk(&sid("u.txt"), content, None, &config);
        for c in &chunks {
            // Slicing already panics on bad boundaries; verify spans map back.
            assert_eq!(&normalize(content)[c.span.start..c.span.end], c.text);
        }
    }

    #[test]
    fn chunk_indexes_are_sequential() {
        let config = cfg(30, 5);
        let content = "def a():\n    pass\n\ndef b():\n    pass\n\ndef c():\n    pass\n";
        let chunks = chunk(&sid("seq.py"), content, Some("python"), &config);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, ChunkIndex(i as u32));
        }
    }
}
