//! Line-aware chunkers.
//!
//! Every chunker turns a decoded source file into [`ChunkDraft`]s that carry
//! a 1-based inclusive line [`Span`] and the SHA-256 of their text. The
//! content hash is the deduplication key for embeddings, and
//! [`chunk_id`] derives a stable identifier from it, so unchanged input
//! always produces the same chunk set.
//!
//! Three strategies are provided:
//!
//! | Chunker | Blocks | Merging |
//! |---------|--------|---------|
//! | [`ProseChunker`] | paragraphs; markdown headings start a new chunk | up to `max_tokens` |
//! | [`CodeChunker`] | blank-line separated blocks | up to `max_lines` and `max_tokens` |
//! | [`SymbolChunker`] | top-level definitions (`fn`, `def`, `class`, …) | never merged |
//!
//! [`ByExtensionChunker`] picks one of them per file extension.
//!
//! # Example
//!
//! ```rust
//! use resource_index_core::chunk::{Chunker, ProseChunker};
//!
//! let chunker = ProseChunker::new(700);
//! let drafts = chunker.chunk("notes.md", "Hello world.\n\nSecond paragraph.").unwrap();
//! assert_eq!(drafts.len(), 1);
//! assert_eq!(drafts[0].span.start_line, 1);
//! assert_eq!(drafts[0].span.end_line, 3);
//! ```

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::models::{ChunkKind, Span};

/// Approximate characters-per-token ratio used to turn token budgets into
/// character budgets.
pub const CHARS_PER_TOKEN: usize = 4;

/// Why a file could not be chunked. The pipeline records these as job
/// warnings and skips the file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("binary content (NUL byte at offset {offset})")]
    Binary { offset: usize },
    #[error("content is not valid UTF-8")]
    NotUtf8,
    #[error("file is {bytes} bytes, limit is {limit}")]
    TooLarge { bytes: usize, limit: usize },
}

/// A chunk before it is bound to a resource and generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub span: Span,
    pub text: String,
    pub content_hash: String,
    pub kind: ChunkKind,
}

/// Splits one file's text into chunks.
///
/// Whitespace-only input yields zero chunks; that is not an error.
pub trait Chunker: Send + Sync {
    fn chunk(&self, path: &str, text: &str) -> Result<Vec<ChunkDraft>, ChunkError>;
}

/// Decode raw file bytes for chunking, rejecting oversized, binary, and
/// non-UTF-8 content.
pub fn decode_text(bytes: &[u8], max_bytes: usize) -> Result<&str, ChunkError> {
    if bytes.len() > max_bytes {
        return Err(ChunkError::TooLarge {
            bytes: bytes.len(),
            limit: max_bytes,
        });
    }
    if let Some(offset) = bytes.iter().position(|b| *b == 0) {
        return Err(ChunkError::Binary { offset });
    }
    std::str::from_utf8(bytes).map_err(|_| ChunkError::NotUtf8)
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk identifier.
///
/// Derived from `(resource_id, source_path, ordinal, content_hash)` so a
/// re-index of identical content reproduces identical ids.
pub fn chunk_id(
    resource_id: &str,
    source_path: &str,
    ordinal: usize,
    content_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// Rebuild a file's text from its chunks, given in ordinal order.
///
/// Lines no chunk covers (blank separators) come back empty and trailing
/// blank lines are lost. Fragments of a hard-split long line share one
/// span and are rejoined with a single space.
pub fn reassemble<'a>(chunks: impl IntoIterator<Item = (Span, &'a str)>) -> String {
    let mut lines: BTreeMap<u32, String> = BTreeMap::new();
    for (span, text) in chunks {
        if span.end_line <= span.start_line {
            lines
                .entry(span.start_line)
                .and_modify(|line| {
                    line.push(' ');
                    line.push_str(text);
                })
                .or_insert_with(|| text.to_string());
            continue;
        }
        for (offset, line) in text.split('\n').enumerate() {
            lines
                .entry(span.start_line + offset as u32)
                .or_insert_with(|| line.to_string());
        }
    }

    let Some(&last) = lines.keys().next_back() else {
        return String::new();
    };
    (1..=last)
        .map(|n| lines.get(&n).map(String::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

fn check_text(text: &str) -> Result<(), ChunkError> {
    match text.find('\0') {
        Some(offset) => Err(ChunkError::Binary { offset }),
        None => Ok(()),
    }
}

/// A run of lines (0-based, inclusive) that packing treats as a unit.
#[derive(Debug, Clone, Copy)]
struct Block {
    start: usize,
    end: usize,
    /// Never merge this block with the preceding buffer.
    hard_break: bool,
}

/// Character offsets of the line table so any `[start, end]` range can be
/// measured in O(1).
struct Lines<'a> {
    lines: Vec<&'a str>,
    prefix: Vec<usize>,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let mut prefix = Vec::with_capacity(lines.len() + 1);
        prefix.push(0);
        for line in &lines {
            let last = prefix[prefix.len() - 1];
            prefix.push(last + line.len() + 1);
        }
        Self { lines, prefix }
    }

    fn chars(&self, start: usize, end: usize) -> usize {
        self.prefix[end + 1] - self.prefix[start] - 1
    }

    fn text(&self, start: usize, end: usize) -> String {
        self.lines[start..=end].join("\n")
    }

    fn is_blank(&self, i: usize) -> bool {
        self.lines[i].trim().is_empty()
    }

    /// Blank-line separated blocks. `heading_breaks` additionally starts a
    /// new hard-break block at every markdown heading.
    fn paragraphs(&self, heading_breaks: bool) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut current: Option<Block> = None;
        for i in 0..self.lines.len() {
            if self.is_blank(i) {
                if let Some(b) = current.take() {
                    blocks.push(b);
                }
                continue;
            }
            let heading = heading_breaks && is_markdown_heading(self.lines[i]);
            match current.as_mut() {
                Some(b) if !heading => b.end = i,
                _ => {
                    if let Some(b) = current.take() {
                        blocks.push(b);
                    }
                    current = Some(Block {
                        start: i,
                        end: i,
                        hard_break: heading,
                    });
                }
            }
        }
        if let Some(b) = current {
            blocks.push(b);
        }
        blocks
    }
}

fn is_markdown_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .map(|c| c == ' ')
            .unwrap_or(true)
}

/// Emitted piece: 0-based inclusive line range plus its text.
struct Piece {
    start: usize,
    end: usize,
    text: String,
}

/// Greedy packing of blocks into pieces bounded by `max_lines` and
/// `max_chars`. Oversized blocks are cut into line windows; a single line
/// longer than `max_chars` is hard-split and every fragment keeps that
/// line's span.
fn pack(lines: &Lines<'_>, blocks: &[Block], max_lines: usize, max_chars: usize) -> Vec<Piece> {
    let mut out = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    let flush = |out: &mut Vec<Piece>, range: Option<(usize, usize)>| {
        if let Some((s, e)) = range {
            out.push(Piece {
                start: s,
                end: e,
                text: lines.text(s, e),
            });
        }
    };

    for block in blocks {
        if block.hard_break {
            flush(&mut out, current.take());
        }

        let block_lines = block.end - block.start + 1;
        if block_lines > max_lines || lines.chars(block.start, block.end) > max_chars {
            flush(&mut out, current.take());
            split_block(lines, *block, max_lines, max_chars, &mut out);
            continue;
        }

        current = match current {
            Some((s, e)) => {
                let merged_lines = block.end - s + 1;
                if merged_lines > max_lines || lines.chars(s, block.end) > max_chars {
                    flush(&mut out, Some((s, e)));
                    Some((block.start, block.end))
                } else {
                    Some((s, block.end))
                }
            }
            None => Some((block.start, block.end)),
        };
    }
    flush(&mut out, current);
    out
}

fn split_block(
    lines: &Lines<'_>,
    block: Block,
    max_lines: usize,
    max_chars: usize,
    out: &mut Vec<Piece>,
) {
    let mut start = block.start;
    while start <= block.end {
        let mut end = start;
        while end < block.end
            && end + 1 - start < max_lines
            && lines.chars(start, end + 1) <= max_chars
        {
            end += 1;
        }
        if start == end && lines.chars(start, end) > max_chars {
            for fragment in split_long_line(lines.lines[start], max_chars) {
                out.push(Piece {
                    start,
                    end,
                    text: fragment.to_string(),
                });
            }
        } else {
            out.push(Piece {
                start,
                end,
                text: lines.text(start, end),
            });
        }
        start = end + 1;
    }
}

/// Split an overlong line at space boundaries where possible.
fn split_long_line(line: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = line;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining);
            break;
        }
        let mut split_at = snap_to_char_boundary(remaining, max_chars);
        if let Some(space) = remaining[..split_at].rfind(' ') {
            if space > 0 {
                split_at = space + 1;
            }
        }
        if split_at == 0 {
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let piece = &remaining[..split_at];
        if !piece.trim().is_empty() {
            pieces.push(piece.trim_end());
        }
        remaining = &remaining[split_at..];
    }
    pieces
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_draft(piece: Piece, kind: ChunkKind) -> Option<ChunkDraft> {
    if piece.text.trim().is_empty() {
        return None;
    }
    Some(ChunkDraft {
        span: Span::new(piece.start as u32 + 1, piece.end as u32 + 1),
        content_hash: content_hash(piece.text.as_bytes()),
        text: piece.text,
        kind,
    })
}

/// Paragraph chunker for prose and markdown.
#[derive(Debug, Clone)]
pub struct ProseChunker {
    max_chars: usize,
}

impl ProseChunker {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_chars: max_tokens.max(1) * CHARS_PER_TOKEN,
        }
    }
}

impl Chunker for ProseChunker {
    fn chunk(&self, _path: &str, text: &str) -> Result<Vec<ChunkDraft>, ChunkError> {
        check_text(text)?;
        let lines = Lines::new(text);
        let blocks = lines.paragraphs(true);
        Ok(pack(&lines, &blocks, usize::MAX, self.max_chars)
            .into_iter()
            .filter_map(|p| make_draft(p, ChunkKind::Prose))
            .collect())
    }
}

/// Block chunker for source code without recognisable top-level symbols.
#[derive(Debug, Clone)]
pub struct CodeChunker {
    max_lines: usize,
    max_chars: usize,
}

impl CodeChunker {
    pub fn new(max_tokens: usize, max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            max_chars: max_tokens.max(1) * CHARS_PER_TOKEN,
        }
    }

    fn pieces(&self, lines: &Lines<'_>) -> Vec<Piece> {
        let blocks = lines.paragraphs(false);
        pack(lines, &blocks, self.max_lines, self.max_chars)
    }
}

impl Chunker for CodeChunker {
    fn chunk(&self, _path: &str, text: &str) -> Result<Vec<ChunkDraft>, ChunkError> {
        check_text(text)?;
        let lines = Lines::new(text);
        Ok(self
            .pieces(&lines)
            .into_iter()
            .filter_map(|p| make_draft(p, ChunkKind::Code))
            .collect())
    }
}

const SYMBOL_MODIFIERS: &[&str] = &[
    "pub(crate) ",
    "pub(super) ",
    "pub ",
    "export default ",
    "export ",
    "async ",
    "unsafe ",
    "default ",
    "abstract ",
];

const SYMBOL_KEYWORDS: &[&str] = &[
    "fn ",
    "struct ",
    "enum ",
    "trait ",
    "impl ",
    "impl<",
    "mod ",
    "macro_rules!",
    "def ",
    "class ",
    "function ",
    "function*",
    "interface ",
    "type ",
    "func ",
    "module ",
];

/// Whether a line opens a top-level definition.
fn is_symbol_line(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let mut rest = line;
    loop {
        match SYMBOL_MODIFIERS.iter().find(|m| rest.starts_with(*m)) {
            Some(m) => rest = &rest[m.len()..],
            None => break,
        }
    }
    SYMBOL_KEYWORDS.iter().any(|k| rest.starts_with(k))
}

/// Lines that belong to the definition that follows them.
fn is_symbol_prefix_line(line: &str) -> bool {
    line.starts_with('@') || line.starts_with("#[") || line.starts_with("///")
}

/// One chunk per top-level definition; text before the first definition is
/// chunked as code.
#[derive(Debug, Clone)]
pub struct SymbolChunker {
    code: CodeChunker,
}

impl SymbolChunker {
    pub fn new(max_tokens: usize, max_lines: usize) -> Self {
        Self {
            code: CodeChunker::new(max_tokens, max_lines),
        }
    }

    /// Start lines (0-based) of every top-level definition, pulled up over
    /// decorators, attributes, and doc comments directly above it.
    fn symbol_starts(lines: &Lines<'_>) -> Vec<usize> {
        let mut starts = Vec::new();
        let mut pending: Option<usize> = None;
        for (i, line) in lines.lines.iter().enumerate() {
            if is_symbol_prefix_line(line) {
                pending.get_or_insert(i);
                continue;
            }
            if is_symbol_line(line) {
                starts.push(pending.unwrap_or(i));
            }
            pending = None;
        }
        starts
    }
}

impl Chunker for SymbolChunker {
    fn chunk(&self, path: &str, text: &str) -> Result<Vec<ChunkDraft>, ChunkError> {
        check_text(text)?;
        let lines = Lines::new(text);
        let starts = Self::symbol_starts(&lines);
        if starts.is_empty() {
            return self.code.chunk(path, text);
        }

        let mut drafts = Vec::new();

        if starts[0] > 0 {
            let preamble: Vec<Block> = lines
                .paragraphs(false)
                .into_iter()
                .filter(|b| b.end < starts[0])
                .collect();
            drafts.extend(
                pack(&lines, &preamble, self.code.max_lines, self.code.max_chars)
                    .into_iter()
                    .filter_map(|p| make_draft(p, ChunkKind::Code)),
            );
        }

        for (n, &start) in starts.iter().enumerate() {
            let mut end = starts
                .get(n + 1)
                .map(|next| next - 1)
                .unwrap_or(lines.lines.len() - 1);
            while end > start && lines.is_blank(end) {
                end -= 1;
            }
            let block = Block {
                start,
                end,
                hard_break: true,
            };
            drafts.extend(
                pack(&lines, &[block], self.code.max_lines, self.code.max_chars)
                    .into_iter()
                    .filter_map(|p| make_draft(p, ChunkKind::Symbol)),
            );
        }

        Ok(drafts)
    }
}

const PROSE_EXTENSIONS: &[&str] = &["md", "markdown", "mdx", "txt", "rst", "adoc", "html", "htm"];
const SYMBOL_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "js", "jsx", "mjs", "cjs", "ts", "tsx", "go", "rb", "kt", "scala", "swift",
];

/// Chooses prose, symbol, or code chunking by file extension. Files
/// without an extension (`README`, `LICENSE`) are treated as prose.
#[derive(Debug, Clone)]
pub struct ByExtensionChunker {
    prose: ProseChunker,
    code: CodeChunker,
    symbol: SymbolChunker,
}

impl ByExtensionChunker {
    pub fn new(max_tokens: usize, max_lines: usize) -> Self {
        Self {
            prose: ProseChunker::new(max_tokens),
            code: CodeChunker::new(max_tokens, max_lines),
            symbol: SymbolChunker::new(max_tokens, max_lines),
        }
    }

    fn pick(&self, path: &str) -> &dyn Chunker {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let ext = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
            _ => return &self.prose,
        };
        if PROSE_EXTENSIONS.contains(&ext.as_str()) {
            &self.prose
        } else if SYMBOL_EXTENSIONS.contains(&ext.as_str()) {
            &self.symbol
        } else {
            &self.code
        }
    }
}

impl Chunker for ByExtensionChunker {
    fn chunk(&self, path: &str, text: &str) -> Result<Vec<ChunkDraft>, ChunkError> {
        self.pick(path).chunk(path, text)
    }
}
