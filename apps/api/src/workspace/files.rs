//! Virtual File Store — the in-memory path → content mapping for a generated site.
//!
//! Ordered by insertion. Every entry point normalizes paths, so `index.html` and
//! `/index.html` address the same file. Files are never removed one at a time:
//! `replace_all`, `clear` and `restore` swap the whole set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("file path cannot be empty")]
    EmptyPath,
    #[error("'/' is the root directory, not a file path")]
    RootPath,
}

/// Display language of a file, inferred from its extension.
/// Only used for syntax highlighting in editor views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Html,
    Css,
    Javascript,
    Typescript,
    Plaintext,
}

impl Language {
    pub fn from_path(path: &str) -> Self {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("html") => Language::Html,
            Some("css") => Language::Css,
            Some("js") => Language::Javascript,
            Some("ts") | Some("tsx") => Language::Typescript,
            _ => Language::Plaintext,
        }
    }

    /// Parses a language tag as sent on the wire; unknown tags yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "html" => Some(Language::Html),
            "css" => Some(Language::Css),
            "javascript" | "js" => Some(Language::Javascript),
            "typescript" | "ts" | "tsx" => Some(Language::Typescript),
            "plaintext" | "text" => Some(Language::Plaintext),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Html => "html",
            Language::Css => "css",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Plaintext => "plaintext",
        }
    }
}

/// A single file in the store. `content` is always the last full value written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFile {
    pub path: String,
    pub content: String,
    pub language: Language,
    /// Starts at 1, bumped only when a write changes the content.
    pub version: u32,
}

/// A pending write: what generators, events and editors hand to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
    pub language: Language,
}

impl FileWrite {
    /// Builds a write whose language is inferred from the path.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = normalize_path(&path.into());
        let language = Language::from_path(&path);
        Self {
            path,
            content: content.into(),
            language,
        }
    }

    pub fn with_language(mut self, language: Option<Language>) -> Self {
        if let Some(language) = language {
            self.language = language;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Captured store state used to roll back an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    files: Vec<VirtualFile>,
    active: Option<String>,
}

impl FileSnapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualFileStore {
    files: Vec<VirtualFile>,
    index: HashMap<String, usize>,
    active: Option<String>,
}

impl VirtualFileStore {
    /// Discards all files and installs `files`. The active file is kept if one is
    /// set, otherwise the first installed path becomes active. Used for first generation.
    pub fn replace_all<I>(&mut self, files: I) -> Vec<String>
    where
        I: IntoIterator<Item = FileWrite>,
    {
        self.files.clear();
        self.index.clear();
        self.merge(files)
    }

    /// Overwrites or inserts each given file, leaving unmentioned paths alone.
    /// Returns the paths whose content actually changed.
    pub fn merge<I>(&mut self, files: I) -> Vec<String>
    where
        I: IntoIterator<Item = FileWrite>,
    {
        let mut changed = Vec::new();
        for file in files {
            let path = normalize_path(&file.path);
            match self.upsert(file) {
                Ok(WriteOutcome::Unchanged) => {}
                Ok(WriteOutcome::Inserted | WriteOutcome::Updated) => changed.push(path.clone()),
                Err(e) => {
                    warn!("Skipping file write: {e}");
                    continue;
                }
            }
            if self.active.is_none() {
                self.active = Some(path);
            }
        }
        changed
    }

    /// Writes one file. Overwriting with identical content is a no-op.
    pub fn upsert(&mut self, file: FileWrite) -> Result<WriteOutcome, StoreError> {
        let path = normalize_path(&file.path);
        if path.is_empty() {
            return Err(StoreError::EmptyPath);
        }
        if path == "/" {
            return Err(StoreError::RootPath);
        }

        if let Some(&i) = self.index.get(&path) {
            let existing = &mut self.files[i];
            if existing.content == file.content && existing.language == file.language {
                return Ok(WriteOutcome::Unchanged);
            }
            if existing.content != file.content {
                existing.version += 1;
            }
            existing.content = file.content;
            existing.language = file.language;
            return Ok(WriteOutcome::Updated);
        }

        self.index.insert(path.clone(), self.files.len());
        self.files.push(VirtualFile {
            path,
            content: file.content,
            language: file.language,
            version: 1,
        });
        Ok(WriteOutcome::Inserted)
    }

    /// Direct overwrite of one path, as done by a manual editor.
    pub fn set_content(&mut self, path: &str, content: &str) -> Result<WriteOutcome, StoreError> {
        if path.trim().is_empty() {
            return Err(StoreError::EmptyPath);
        }
        self.upsert(FileWrite::new(path, content))
    }

    /// Selects the file shown in editor views. The path need not exist yet.
    pub fn set_active(&mut self, path: &str) {
        self.active = Some(normalize_path(path));
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn get(&self, path: &str) -> Option<&VirtualFile> {
        self.index
            .get(&normalize_path(path))
            .map(|&i| &self.files[i])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(&normalize_path(path))
    }

    pub fn files(&self) -> &[VirtualFile] {
        &self.files
    }

    /// Files whose path lives under `directory` (the root lists everything).
    pub fn list_dir(&self, directory: &str) -> Vec<&VirtualFile> {
        let mut prefix = normalize_path(directory);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.files
            .iter()
            .filter(|f| prefix == "/" || f.path.starts_with(&prefix))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Drops every file and the active selection.
    pub fn clear(&mut self) {
        self.files.clear();
        self.index.clear();
        self.active = None;
    }

    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            files: self.files.clone(),
            active: self.active.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: FileSnapshot) {
        self.index = snapshot
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path.clone(), i))
            .collect();
        self.files = snapshot.files;
        self.active = snapshot.active;
    }
}

/// Canonical path form: forward slashes, one leading `/`, no trailing `/`.
/// Blank input stays blank so callers can reject it.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    if path.is_empty() {
        return path;
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
