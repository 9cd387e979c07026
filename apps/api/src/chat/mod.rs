//! Chat — conversational generation against the current file set.
//!
//! A turn sends the prior files, the user's message and the conversation so far.
//! The reply is read either as `file-block/1` text or as the JSON shape
//! `{"message", "files": {path: {content, language}}}` (a bare `{"html": ...}` is the legacy
//! single-document form). The session decides how the files are applied.
//!
//! `AppState` holds an `Arc<dyn CompletionService>`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

pub mod prompts;

use crate::llm_client::{ChatMessage, LlmClient, LlmError};
use crate::workspace::files::{FileWrite, Language, VirtualFile};
use crate::workspace::protocol::{parse_file_blocks, strip_code_fence, LEGACY_DOCUMENT_PATH};

// ────────────────────────────────────────────────────────────────────────────
// Request / response models
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prior_files: Vec<VirtualFile>,
    pub message: String,
    /// Earlier turns, oldest first.
    pub history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatResponse {
    pub message: String,
    pub files: Vec<FileWrite>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    files: Option<WireFiles>,
    #[serde(default)]
    html: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFiles {
    Map(BTreeMap<String, WireEntry>),
    List(Vec<WireFile>),
}

/// A `files` map value: `{content, language?}`, or just the content string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireEntry {
    Text(String),
    File {
        content: String,
        #[serde(default)]
        language: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct WireFile {
    path: String,
    content: String,
    #[serde(default)]
    language: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Trait definition
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

// ────────────────────────────────────────────────────────────────────────────
// LlmCompletion — Claude-backed implementation
// ────────────────────────────────────────────────────────────────────────────

pub struct LlmCompletion {
    llm: LlmClient,
}

impl LlmCompletion {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl CompletionService for LlmCompletion {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut messages = request.history.clone();
        messages.push(ChatMessage::user(prompts::user_turn(
            &request.message,
            &request.prior_files,
        )));

        let text = self
            .llm
            .call_text(&prompts::chat_system_prompt(), &messages)
            .await?;
        let response = parse_response(&text);

        debug!(
            "Chat turn produced {} files ({} prior)",
            response.files.len(),
            request.prior_files.len()
        );
        Ok(response)
    }
}

/// Reads a completion reply in any of the accepted shapes. Never fails: a reply
/// with no recognizable files is all message.
pub fn parse_response(text: &str) -> ChatResponse {
    if let Some(response) = parse_json_response(text) {
        return response;
    }
    let output = parse_file_blocks(text);
    ChatResponse {
        message: output.message,
        files: output.files,
    }
}

fn parse_json_response(text: &str) -> Option<ChatResponse> {
    let body = strip_code_fence(text);
    if !body.starts_with('{') {
        return None;
    }
    let wire: WireResponse = serde_json::from_str(body).ok()?;

    let files = match (wire.files, wire.html) {
        (Some(WireFiles::Map(map)), _) => map
            .into_iter()
            .map(|(path, entry)| match entry {
                WireEntry::Text(content) => FileWrite::new(path, content),
                WireEntry::File { content, language } => FileWrite::new(path, content)
                    .with_language(language.as_deref().and_then(Language::from_name)),
            })
            .collect(),
        (Some(WireFiles::List(list)), _) => list
            .into_iter()
            .map(|f| {
                let language = f.language.as_deref().and_then(Language::from_name);
                FileWrite::new(f.path, f.content).with_language(language)
            })
            .collect(),
        (None, Some(html)) => vec![FileWrite::new(LEGACY_DOCUMENT_PATH, html)],
        (None, None) if wire.message.is_some() => Vec::new(),
        (None, None) => return None,
    };

    Some(ChatResponse {
        message: wire.message.unwrap_or_default(),
        files: files
            .into_iter()
            .filter(|f: &FileWrite| !f.path.is_empty())
            .collect(),
    })
}
