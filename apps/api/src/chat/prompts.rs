// Prompt constants for chat turns.
// Reuses cross-cutting fragments from llm_client::prompts.

use crate::llm_client::prompts::{FILE_BLOCK_FORMAT, SITE_LAYOUT};
use crate::workspace::files::VirtualFile;

/// System prompt for chat turns. Replace `{layout}` and `{format}` before sending.
const CHAT_SYSTEM_TEMPLATE: &str = "You are an expert front-end developer building a \
    personal portfolio website together with its owner. You write clean, semantic, \
    accessible HTML, modern CSS and small amounts of vanilla JavaScript.\n\n\
    {layout}\n\n{format}";

/// First turn: nothing exists yet. Replace `{request}` before sending.
const CREATE_PROMPT_TEMPLATE: &str = r#"Create a complete portfolio website for this request:

{request}

Return every file the site needs."#;

/// Later turns. Replace `{files}` and `{request}` before sending.
const EDIT_PROMPT_TEMPLATE: &str = r#"The site currently consists of these files:

{files}

Apply this change:

{request}

Return ONLY the files you changed, each in full. Files you do not return are kept as they are."#;

pub fn chat_system_prompt() -> String {
    CHAT_SYSTEM_TEMPLATE
        .replace("{layout}", SITE_LAYOUT)
        .replace("{format}", FILE_BLOCK_FORMAT)
}

/// The user turn sent for `request`, carrying the current files when there are any.
pub fn user_turn(request: &str, prior_files: &[VirtualFile]) -> String {
    if prior_files.is_empty() {
        return CREATE_PROMPT_TEMPLATE.replace("{request}", request);
    }

    let files = prior_files
        .iter()
        .map(|f| format!("<file path=\"{}\">\n{}\n</file>", f.path, f.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    // `{request}` last so user text containing "{files}" is left alone.
    EDIT_PROMPT_TEMPLATE
        .replace("{files}", &files)
        .replace("{request}", request)
}
