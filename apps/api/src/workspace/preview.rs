//! Preview Assembler — composes the file store into one self-contained HTML document.
//!
//! With an `/index.html` present, that document is the base and its references to
//! `/styles.css` and `/script.js` are inlined in place. Without one, a document is
//! synthesized from every stylesheet, HTML fragment and script, each group ordered
//! by path. Output depends only on store contents.

use std::sync::LazyLock;

use regex::{NoExpand, Regex};

use crate::workspace::files::{VirtualFile, VirtualFileStore};

const INDEX_PATH: &str = "/index.html";
const STYLESHEET_PATH: &str = "/styles.css";
const SCRIPT_PATH: &str = "/script.js";

/// `<link ... href="./styles.css">` or `href="/styles.css"`, either quote style.
static STYLESHEET_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<link\b[^>]*?\bhref\s*=\s*["'](?:\./|/)styles\.css["'][^>]*>"#)
        .expect("stylesheet link pattern is valid")
});

/// `<script src="<anything>/script.js"></script>`, or a bare `script.js`.
static SCRIPT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script\b[^>]*?\bsrc\s*=\s*["'](?:[^"']*/)?script\.js["'][^>]*>\s*</script\s*>"#)
        .expect("script tag pattern is valid")
});

pub fn assemble(store: &VirtualFileStore) -> String {
    match store.get(INDEX_PATH) {
        Some(index) => inline_assets(&index.content, store),
        None => synthesize(store),
    }
}

fn inline_assets(document: &str, store: &VirtualFileStore) -> String {
    let mut html = document.to_string();

    if let Some(css) = store.get(STYLESHEET_PATH) {
        let block = format!("<style>\n{}\n</style>", css.content);
        html = STYLESHEET_LINK
            .replace_all(&html, NoExpand(&block))
            .into_owned();
    }

    if let Some(js) = store.get(SCRIPT_PATH) {
        let block = format!("<script>\n{}\n</script>", js.content);
        html = SCRIPT_TAG.replace_all(&html, NoExpand(&block)).into_owned();
    }

    html
}

fn synthesize(store: &VirtualFileStore) -> String {
    let mut files: Vec<&VirtualFile> = store.files().iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let join = |extension: &str, separator: &str| {
        files
            .iter()
            .filter(|f| has_extension(&f.path, extension) && f.path != INDEX_PATH)
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    };

    let styles = join("css", "\n");
    let body = join("html", "\n");
    let scripts = join("js", ";\n");

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Preview</title>
<style>
{styles}
</style>
</head>
<body>
{body}
<script>
{scripts}
</script>
</body>
</html>
"#
    )
}

/// Grouping goes by path, never by the language tag a writer attached.
fn has_extension(path: &str, extension: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::files::{FileWrite, Language};

    fn store(files: &[(&str, &str)]) -> VirtualFileStore {
        let mut store = VirtualFileStore::default();
        store.merge(files.iter().map(|(p, c)| FileWrite::new(*p, *c)));
        store
    }

    #[test]
    fn test_inlines_relative_stylesheet() {
        let store = store(&[
            (
                "/index.html",
                r#"<html><head><link rel="stylesheet" href="./styles.css"></head><body></body></html>"#,
            ),
            ("/styles.css", "body { color: red; }"),
        ]);

        let html = assemble(&store);

        assert!(html.contains("<style>\nbody { color: red; }\n</style>"));
        assert!(!html.contains("<link"));
        assert!(!html.contains("styles.css"));
    }

    #[test]
    fn test_inlines_absolute_stylesheet_and_script() {
        let store = store(&[
            (
                "/index.html",
                r#"<head><link href='/styles.css' rel='stylesheet' /></head><body><script src="/js/../script.js"></script></body>"#,
            ),
            ("/styles.css", "h1{}"),
            ("/script.js", "console.log('hi')"),
        ]);

        let html = assemble(&store);

        assert!(html.contains("<style>\nh1{}\n</style>"));
        assert!(html.contains("<script>\nconsole.log('hi')\n</script>"));
        assert!(!html.contains("src="));
    }

    #[test]
    fn test_each_matching_tag_is_replaced_once() {
        let store = store(&[
            (
                "/index.html",
                r#"<link href="./styles.css"><link href="./styles.css">"#,
            ),
            ("/styles.css", "p{}"),
        ]);

        let html = assemble(&store);

        assert_eq!(html.matches("<style>").count(), 2);
        assert!(!html.contains("<link"));
    }

    #[test]
    fn test_other_assets_are_left_alone() {
        let index = r#"<link href="./theme.css"><script src="./app.js"></script>"#;
        let store = store(&[
            ("/index.html", index),
            ("/styles.css", "p{}"),
            ("/script.js", "run()"),
        ]);

        assert_eq!(assemble(&store), index);
    }

    #[test]
    fn test_missing_stylesheet_keeps_link() {
        let index = r#"<link href="./styles.css">"#;
        let store = store(&[("/index.html", index)]);
        assert_eq!(assemble(&store), index);
    }

    #[test]
    fn test_dollar_signs_in_assets_are_literal() {
        let store = store(&[
            ("/index.html", r#"<script src="script.js"></script>"#),
            ("/script.js", "const price = `$${amount}`; $1"),
        ]);

        let html = assemble(&store);

        assert!(html.contains("const price = `$${amount}`; $1"));
    }

    #[test]
    fn test_empty_store_yields_shell() {
        let html = assemble(&VirtualFileStore::default());

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<style>\n\n</style>"));
        assert!(html.contains("<body>\n\n<script>\n\n</script>\n</body>"));
        assert!(html.trim_end().ends_with("</html>"));
    }

    #[test]
    fn test_synthesis_groups_by_extension_not_language_tag() {
        let mut store = VirtualFileStore::default();
        store
            .upsert(
                FileWrite::new("/styles.css", "h1{color:red}")
                    .with_language(Some(Language::Plaintext)),
            )
            .unwrap();
        store
            .upsert(
                FileWrite::new("/components/Hero.tsx", "const x: number = 1;")
                    .with_language(Some(Language::Javascript)),
            )
            .unwrap();

        let html = assemble(&store);

        assert!(html.contains("<style>\nh1{color:red}\n</style>"));
        assert!(!html.contains("const x: number = 1;"));
    }

    #[test]
    fn test_synthesized_document_orders_by_path() {
        let unordered = store(&[
            ("/components/projects.html", "<section id=\"projects\"></section>"),
            ("/script.js", "b()"),
            ("/components/hero.html", "<section id=\"hero\"></section>"),
            ("/base.css", "a{}"),
            ("/app.js", "a()"),
            ("/styles.css", "b{}"),
        ]);

        let html = assemble(&unordered);

        let hero = html.find("id=\"hero\"").unwrap();
        let projects = html.find("id=\"projects\"").unwrap();
        assert!(hero < projects);
        assert!(html.contains("<style>\na{}\nb{}\n</style>"));
        assert!(html.contains("<script>\na();\nb()\n</script>"));
    }

    #[test]
    fn test_synthesis_is_independent_of_insertion_order() {
        let a = store(&[("/b.css", "b"), ("/a.css", "a"), ("/x.html", "<p>x</p>")]);
        let b = store(&[("/x.html", "<p>x</p>"), ("/a.css", "a"), ("/b.css", "b")]);
        assert_eq!(assemble(&a), assemble(&b));
    }
}
