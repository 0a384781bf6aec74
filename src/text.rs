// ABOUTME: Text utilities for outbound message shaping.
// ABOUTME: Markdown-aware chunking, table flattening, render-mode detection, and file-marker extraction.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Default per-message character limit for outbound sends.
pub const DEFAULT_CHUNK_LIMIT: usize = 4000;

/// Split long text into chunks, preferring line boundaries and falling back
/// to word boundaries. Chunk order is significant: the platform has no
/// continuation id, so the caller must send chunks sequentially.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        // Flush the current chunk if this line would overflow it.
        if !current.is_empty() && current.len() + line.len() + 1 > max_chars {
            chunks.push(current.trim_end().to_string());
            current.clear();
        }

        if line.len() > max_chars {
            if !current.is_empty() {
                chunks.push(current.trim_end().to_string());
                current.clear();
            }
            let mut pieces = split_long_line(line, max_chars);
            // Keep the tail piece open so following short lines can join it.
            if let Some(last) = pieces.pop() {
                chunks.extend(pieces);
                current = last;
            }
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }

    if !current.is_empty() {
        chunks.push(current.trim_end().to_string());
    }

    chunks
}

/// Split one overlong line at word boundaries, hard-splitting words that are
/// themselves longer than the limit (at char boundaries).
fn split_long_line(line: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut part = String::new();

    for word in line.split_whitespace() {
        if word.len() > max {
            if !part.is_empty() {
                out.push(std::mem::take(&mut part));
            }
            let mut rest = word;
            while rest.len() > max {
                let mut cut = floor_char_boundary(rest, max);
                if cut == 0 {
                    cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
                }
                out.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            part = rest.to_string();
        } else if !part.is_empty() && part.len() + word.len() + 1 > max {
            out.push(std::mem::take(&mut part));
            part = word.to_string();
        } else {
            if !part.is_empty() {
                part.push(' ');
            }
            part.push_str(word);
        }
    }

    if !part.is_empty() {
        out.push(part);
    }
    out
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Whether the text contains markdown the platform cannot render as plain
/// text: fenced code blocks or tables. Drives the `auto` render mode.
pub fn needs_card_rendering(text: &str) -> bool {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_TABLES);
    for event in Parser::new_ext(text, opts) {
        match event {
            Event::Start(Tag::Table(_)) => return true,
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(_))) => return true,
            _ => {}
        }
    }
    false
}

/// Flatten markdown tables into fixed-width plain text for the `raw` render
/// mode. Non-table lines pass through unchanged.
pub fn flatten_tables(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if is_table_row(lines[i]) && i + 1 < lines.len() && is_separator_row(lines[i + 1]) {
            let mut block = vec![lines[i]];
            let mut j = i + 2;
            while j < lines.len() && is_table_row(lines[j]) {
                block.push(lines[j]);
                j += 1;
            }
            out.extend(render_fixed_width(&block));
            i = j;
        } else {
            out.push(lines[i].to_string());
            i += 1;
        }
    }

    out.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.len() > 1
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && t.contains('-')
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn parse_cells(line: &str) -> Vec<String> {
    let t = line.trim();
    let t = t.strip_prefix('|').unwrap_or(t);
    let t = t.strip_suffix('|').unwrap_or(t);
    t.split('|').map(|c| c.trim().to_string()).collect()
}

fn render_fixed_width(rows: &[&str]) -> Vec<String> {
    let parsed: Vec<Vec<String>> = rows.iter().map(|r| parse_cells(r)).collect();
    let columns = parsed.iter().map(Vec::len).max().unwrap_or(0);

    let mut widths = vec![0usize; columns];
    for row in &parsed {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
    }

    parsed
        .iter()
        .map(|row| {
            let mut line = String::new();
            for (idx, width) in widths.iter().enumerate() {
                let cell = row.get(idx).map(String::as_str).unwrap_or("");
                line.push_str(cell);
                let pad = width.saturating_sub(cell.chars().count());
                if idx + 1 < columns {
                    line.extend(std::iter::repeat(' ').take(pad + 2));
                }
            }
            line.trim_end().to_string()
        })
        .collect()
}

// =============================================================================
// Inline file markers
// =============================================================================

/// An inline file-transfer marker extracted from agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMarker {
    pub path: String,
    pub name: Option<String>,
}

#[derive(Deserialize)]
struct FileMarkerBody {
    path: String,
    #[serde(default)]
    name: Option<String>,
}

fn file_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[FILE\](\{.*?\})\[/FILE\]").expect("static regex"))
}

/// Extract `[FILE]{"path":...,"name":...}[/FILE]` markers from agent text.
///
/// Returns the text with valid markers removed plus the parsed markers in
/// document order. A marker whose JSON body fails to parse is left in the
/// text untouched rather than silently swallowed.
pub fn extract_file_markers(text: &str) -> (String, Vec<FileMarker>) {
    let re = file_marker_regex();
    let mut markers = Vec::new();
    let mut cleaned = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let whole = caps.get(0).expect("capture 0");
        let body = caps.get(1).expect("capture 1").as_str();
        match serde_json::from_str::<FileMarkerBody>(body) {
            Ok(parsed) => {
                cleaned.push_str(&text[last..whole.start()]);
                last = whole.end();
                markers.push(FileMarker {
                    path: parsed.path,
                    name: parsed.name,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring file marker with unparseable body");
            }
        }
    }
    cleaned.push_str(&text[last..]);

    (cleaned.trim().to_string(), markers)
}

// =============================================================================
// Tests
// =============================================================================
