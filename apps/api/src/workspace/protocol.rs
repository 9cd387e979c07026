//! File-block wire format, version `file-block/1`.
//!
//! A generation step returns one text blob. Files travel inside blocks:
//!
//! ```text
//! <file path="/index.html">
//! ...content...
//! </file>
//! ```
//!
//! Grammar rules:
//! - `path` is a double- or single-quoted attribute, normalized to a leading `/`.
//! - A block ends at the first `</file>` after its opening tag (non-greedy).
//! - The body is trimmed. A body wrapped in one markdown code fence loses the fence.
//! - Repeated paths: the last block's content wins, the first block's position is kept.
//! - Everything outside blocks is the human-readable status message.
//! - Unterminated blocks and blocks whose path is empty or `/` are not blocks; their text
//!   stays in the message.
//!
//! Legacy form: when no block is present, a single fenced ```` ```html ```` document
//! is read as `/index.html`.
//!
//! The generator is external, so this parser never fails: "no files" is a valid result.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::workspace::files::{normalize_path, FileWrite};

/// Path every legacy single-document response is stored under.
pub const LEGACY_DOCUMENT_PATH: &str = "/index.html";

static FILE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<file\s+path\s*=\s*(?:"([^"]*)"|'([^']*)')\s*>(.*?)</file\s*>"#)
        .expect("file block pattern is valid")
});

static LEGACY_DOCUMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```html[ \t]*\r?\n(.*?)```").expect("legacy document pattern is valid")
});

/// Files and residual message extracted from one generator response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorOutput {
    pub files: Vec<FileWrite>,
    pub message: String,
}

impl GeneratorOutput {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Extracts file blocks and the status message from raw generator text.
pub fn parse_file_blocks(text: &str) -> GeneratorOutput {
    let mut files: Vec<FileWrite> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut message = String::new();
    let mut last_end = 0;

    for caps in FILE_BLOCK.captures_iter(text) {
        let Some(block) = caps.get(0) else { continue };
        let raw_path = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let path = normalize_path(raw_path);
        if path.is_empty() || path == "/" {
            continue;
        }

        message.push_str(&text[last_end..block.start()]);
        last_end = block.end();

        let body = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let file = FileWrite::new(path.clone(), strip_code_fence(body));
        match positions.get(&path) {
            Some(&i) => files[i] = file,
            None => {
                positions.insert(path, files.len());
                files.push(file);
            }
        }
    }

    if files.is_empty() {
        return parse_legacy_document(text);
    }

    message.push_str(&text[last_end..]);
    GeneratorOutput {
        files,
        message: message.trim().to_string(),
    }
}

/// Fallback for generators that return one whole HTML document in a fence.
fn parse_legacy_document(text: &str) -> GeneratorOutput {
    let Some(caps) = LEGACY_DOCUMENT.captures(text) else {
        return passthrough(text);
    };
    let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
        return passthrough(text);
    };
    let content = body.as_str().trim();
    if content.is_empty() {
        return passthrough(text);
    }

    let message = format!("{}{}", &text[..whole.start()], &text[whole.end()..]);
    GeneratorOutput {
        files: vec![FileWrite::new(LEGACY_DOCUMENT_PATH, content)],
        message: message.trim().to_string(),
    }
}

fn passthrough(text: &str) -> GeneratorOutput {
    GeneratorOutput {
        files: Vec::new(),
        message: text.to_string(),
    }
}

/// Strips a ```lang ... ``` fence wrapped around a whole block body.
pub(crate) fn strip_code_fence(body: &str) -> &str {
    let body = body.trim();
    let Some(rest) = body.strip_prefix("```") else {
        return body;
    };
    let Some((_, inner)) = rest.split_once('\n') else {
        return body;
    };
    inner
        .trim_end()
        .strip_suffix("```")
        .map(|s| s.trim())
        .unwrap_or(body)
}
