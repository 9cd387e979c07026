//! BuildSession — the state behind one open editing surface.
//!
//! Lifecycle: `idle → planning → building → completed | failed`, with `reset`
//! returning to `idle` from anywhere. Once a build has started, status, tasks and
//! files change only through [`consumer::apply_event`](crate::workspace::consumer::apply_event).
//!
//! Two write paths reach the file store. Server events are authoritative while a
//! build is `planning`/`building`; user edits (manual edits, chat turns, undo) are
//! accepted only outside those states.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::workspace::consumer::{self, EventOutcome};
use crate::workspace::events::{BuildEvent, RoutedEvent};
use crate::workspace::files::{
    FileSnapshot, FileWrite, StoreError, VirtualFile, VirtualFileStore, WriteOutcome,
};
use crate::workspace::tasks::{BuildTask, ProgressSummary, TaskGraph};

/// Pre-edit snapshots kept for undo.
const MAX_UNDO_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Idle,
    Planning,
    Building,
    Completed,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Idle => "idle",
            BuildStatus::Planning => "planning",
            BuildStatus::Building => "building",
            BuildStatus::Completed => "completed",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, BuildStatus::Planning | BuildStatus::Building)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport state of the event stream. Independent of build status:
/// losing the stream never fails a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

/// How generated files enter the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// First generation: the response is the whole site.
    Replace,
    /// Surgical edit: the response holds only changed files.
    Merge,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("No active build")]
    NoActiveBuild,

    #[error("Files cannot be edited while the build is {0}")]
    EditWhileBuilding(BuildStatus),

    #[error("Nothing to undo")]
    NothingToUndo,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct BuildSession {
    pub(crate) build_id: Option<String>,
    pub(crate) status: BuildStatus,
    pub(crate) error: Option<String>,
    pub(crate) tasks: TaskGraph,
    pub(crate) files: VirtualFileStore,
    connection: ConnectionState,
    undo: VecDeque<FileSnapshot>,
}

/// Serializable read model handed to API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub build_id: Option<String>,
    pub status: BuildStatus,
    pub error: Option<String>,
    pub tasks: Vec<BuildTask>,
    pub progress: f64,
    pub summary: ProgressSummary,
    /// Pending tasks whose dependencies have all completed.
    pub ready_tasks: Vec<String>,
    pub settled: bool,
    pub files: Vec<VirtualFile>,
    pub active_file: Option<String>,
    pub connection: ConnectionState,
    pub can_undo: bool,
}

impl BuildSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins tracking `build_id`. Prior tasks, files and errors are discarded.
    pub fn start(&mut self, build_id: impl Into<String>) {
        *self = Self {
            build_id: Some(build_id.into()),
            status: BuildStatus::Planning,
            ..Self::default()
        };
    }

    /// Unconditionally back to `idle` with nothing tracked.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Applies an event from a stream, dropping it unless it belongs to the active build.
    pub fn apply_routed(&mut self, routed: &RoutedEvent) -> EventOutcome {
        if self.build_id.as_deref() != Some(routed.build_id.as_str()) {
            debug!(
                "Dropping stale '{}' event for build {} (active: {:?})",
                routed.event.kind(),
                routed.build_id,
                self.build_id
            );
            return EventOutcome::Stale;
        }
        self.apply_event(&routed.event)
    }

    pub fn apply_event(&mut self, event: &BuildEvent) -> EventOutcome {
        consumer::apply_event(self, event)
    }

    pub fn build_id(&self) -> Option<&str> {
        self.build_id.as_deref()
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn tasks(&self) -> &TaskGraph {
        &self.tasks
    }

    pub fn files(&self) -> &VirtualFileStore {
        &self.files
    }

    pub fn progress(&self) -> f64 {
        self.tasks.progress()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        self.connection = state;
    }

    /// The mode a generated response should be applied with right now.
    pub fn apply_mode(&self) -> ApplyMode {
        if self.files.is_empty() {
            ApplyMode::Replace
        } else {
            ApplyMode::Merge
        }
    }

    /// Manual edit of one file. A write that changes content is undoable like a chat turn.
    pub fn edit_file(&mut self, path: &str, content: &str) -> Result<WriteOutcome, SessionError> {
        self.ensure_editable()?;
        let before = self.files.snapshot();
        let outcome = self.files.set_content(path, content)?;
        if outcome != WriteOutcome::Unchanged {
            self.push_undo(before);
        }
        Ok(outcome)
    }

    /// Editor selection; allowed in every state.
    pub fn set_active(&mut self, path: &str) {
        self.files.set_active(path);
    }

    /// Installs generated files, keeping an undo snapshot. Returns changed paths.
    pub fn apply_generated(
        &mut self,
        files: Vec<FileWrite>,
        mode: ApplyMode,
    ) -> Result<Vec<String>, SessionError> {
        self.ensure_editable()?;
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let before = self.files.snapshot();
        self.push_undo(before);

        let changed = match mode {
            ApplyMode::Replace => self.files.replace_all(files),
            ApplyMode::Merge => self.files.merge(files),
        };
        Ok(changed)
    }

    /// Restores the file set as it was before the latest user edit, manual or generated.
    pub fn undo_last_edit(&mut self) -> Result<(), SessionError> {
        self.ensure_editable()?;
        let snapshot = self.undo.pop_back().ok_or(SessionError::NothingToUndo)?;
        debug!("Restoring snapshot with {} files", snapshot.len());
        self.files.restore(snapshot);
        Ok(())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            build_id: self.build_id.clone(),
            status: self.status,
            error: self.error.clone(),
            tasks: self.tasks.tasks().to_vec(),
            progress: self.tasks.progress(),
            summary: self.tasks.summary(),
            ready_tasks: self
                .tasks
                .ready_tasks()
                .into_iter()
                .map(|t| t.id.clone())
                .collect(),
            settled: self.tasks.is_settled(),
            files: self.files.files().to_vec(),
            active_file: self.files.active().map(str::to_string),
            connection: self.connection,
            can_undo: !self.undo.is_empty(),
        }
    }

    fn push_undo(&mut self, snapshot: FileSnapshot) {
        if self.undo.len() == MAX_UNDO_DEPTH {
            self.undo.pop_front();
        }
        self.undo.push_back(snapshot);
    }

    fn ensure_editable(&self) -> Result<(), SessionError> {
        if self.status.is_active() {
            return Err(SessionError::EditWhileBuilding(self.status));
        }
        Ok(())
    }
}
