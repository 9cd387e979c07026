// Shared prompt fragments.
// Each service that needs LLM calls defines its own prompts.rs alongside it.

/// Output contract every code-producing prompt ends with. Must stay in step with
/// the grammar parsed by `workspace::protocol::parse_file_blocks`.
pub const FILE_BLOCK_FORMAT: &str = "\
    OUTPUT FORMAT: Return every file you create or change as \
    <file path=\"/relative/path.ext\">FULL FILE CONTENT</file>. \
    Paths start with '/'. Always send the complete content of a file, never a diff. \
    Do NOT wrap file contents in markdown code fences. \
    Any text outside <file> blocks is shown to the user as your reply, so keep it short.";

/// Site layout the preview expects.
pub const SITE_LAYOUT: &str = "\
    The site is plain HTML, CSS and JavaScript. The entry document is /index.html, \
    which links /styles.css with <link rel=\"stylesheet\" href=\"./styles.css\"> and \
    loads /script.js with <script src=\"./script.js\"></script>. \
    Do not reference external build tools or frameworks that need compilation.";
