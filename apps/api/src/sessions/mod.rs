//! Build Session Controller — owns every open session and mediates commands.
//!
//! Each session is a `SessionHandle` plus, while a build is tracked, one event
//! stream whose items a pump task applies under the session's write lock.
//! Commands go to the build service and never touch session state themselves.
//! Their effects arrive as events. Requests run without holding the session lock,
//! so event application stays responsive while a command is in flight.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub mod handlers;

use crate::build_service::{
    BuildService, StartBuildRequest, StreamItem, Subscription, SubscriptionHandle,
};
use crate::chat::{ChatRequest, CompletionService};
use crate::errors::AppError;
use crate::llm_client::ChatMessage;
use crate::workspace::consumer::EventOutcome;
use crate::workspace::files::{VirtualFile, WriteOutcome};
use crate::workspace::preview;
use crate::workspace::session::{
    ApplyMode, BuildSession, ConnectionState, SessionError, SessionView,
};

/// Thread-safe session handle.
pub type SessionHandle = Arc<RwLock<BuildSession>>;

/// Chat messages replayed to the completion service, oldest dropped first.
const MAX_HISTORY_MESSAGES: usize = 20;

struct StreamSlot {
    build_id: String,
    handle: SubscriptionHandle,
}

impl StreamSlot {
    fn close(&self) {
        self.handle.close();
    }

    /// The pump closes the handle itself when the stream ends.
    fn is_live(&self, build_id: &str) -> bool {
        self.build_id == build_id && !self.handle.is_closed()
    }
}

struct SessionEntry {
    session: SessionHandle,
    stream: Mutex<Option<StreamSlot>>,
    history: Mutex<Vec<ChatMessage>>,
}

/// Outcome of one chat turn.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatTurn {
    pub message: String,
    /// Paths whose content changed.
    pub files: Vec<String>,
    pub mode: ApplyMode,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,
    build_service: Arc<dyn BuildService>,
    completion: Arc<dyn CompletionService>,
}

impl SessionRegistry {
    pub fn new(
        build_service: Arc<dyn BuildService>,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            build_service,
            completion,
        }
    }

    pub async fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        let entry = SessionEntry {
            session: Arc::new(RwLock::new(BuildSession::new())),
            stream: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        };
        self.sessions.write().await.insert(id, Arc::new(entry));
        info!("Created session {id}");
        id
    }

    async fn entry(&self, id: Uuid) -> Result<Arc<SessionEntry>, AppError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Session {id} not found")))
    }

    pub async fn view(&self, id: Uuid) -> Result<SessionView, AppError> {
        let entry = self.entry(id).await?;
        let session = entry.session.read().await;
        Ok(session.view())
    }

    /// Closes the stream and forgets the session. The build itself keeps running remotely.
    pub async fn discard(&self, id: Uuid) -> Result<(), AppError> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("Session {id} not found")))?;
        if let Some(slot) = entry.stream.lock().await.take() {
            slot.close();
        }
        info!("Discarded session {id}");
        Ok(())
    }

    // ── Build commands ──────────────────────────────────────────────────────

    /// Asks the build service for a new build, then tracks it from `planning`.
    /// A failed request leaves the session as it was.
    pub async fn start(
        &self,
        id: Uuid,
        request: StartBuildRequest,
    ) -> Result<SessionView, AppError> {
        let entry = self.entry(id).await?;
        let started = self.build_service.start_build(&request).await?;

        let mut stream = entry.stream.lock().await;
        if let Some(slot) = stream.take() {
            slot.close();
        }
        let view = {
            let mut session = entry.session.write().await;
            session.start(started.id.as_str());
            session.view()
        };
        entry.history.lock().await.clear();
        *stream = Some(self.attach(&entry.session, &started.id));

        info!(
            "Session {id} now tracking build {} (service status: {})",
            started.id,
            started.status.as_deref().unwrap_or("unknown")
        );
        Ok(view)
    }

    pub async fn reset(&self, id: Uuid) -> Result<SessionView, AppError> {
        let entry = self.entry(id).await?;
        if let Some(slot) = entry.stream.lock().await.take() {
            slot.close();
        }
        entry.history.lock().await.clear();
        let mut session = entry.session.write().await;
        session.reset();
        Ok(session.view())
    }

    /// Re-subscribes to the tracked build. The service replays `current_state` first.
    pub async fn reconnect(&self, id: Uuid) -> Result<SessionView, AppError> {
        let entry = self.entry(id).await?;
        let build_id = active_build_id(&entry).await?;

        let mut stream = entry.stream.lock().await;
        if let Some(slot) = stream.take() {
            slot.close();
        }
        *stream = Some(self.attach(&entry.session, &build_id));
        drop(stream);

        debug!("Session {id} re-subscribed to build {build_id}");
        let view = entry.session.read().await.view();
        Ok(view)
    }

    pub async fn retry_task(&self, id: Uuid, task_id: &str) -> Result<(), AppError> {
        let entry = self.entry(id).await?;
        let build_id = active_build_id(&entry).await?;

        self.build_service.retry_task(&build_id, task_id).await?;
        self.ensure_stream(&entry, &build_id).await;
        Ok(())
    }

    pub async fn regenerate_section(
        &self,
        id: Uuid,
        section_id: &str,
        prompt: Option<&str>,
    ) -> Result<(), AppError> {
        let entry = self.entry(id).await?;
        let build_id = active_build_id(&entry).await?;

        self.build_service
            .regenerate_section(&build_id, section_id, prompt)
            .await?;
        self.ensure_stream(&entry, &build_id).await;
        Ok(())
    }

    /// A finished build's stream has ended. Commands that restart work on it need
    /// a live stream again to observe the outcome.
    async fn ensure_stream(&self, entry: &SessionEntry, build_id: &str) {
        let mut stream = entry.stream.lock().await;
        if stream.as_ref().is_some_and(|slot| slot.is_live(build_id)) {
            return;
        }
        if let Some(slot) = stream.take() {
            slot.close();
        }
        *stream = Some(self.attach(&entry.session, build_id));
    }

    fn attach(&self, session: &SessionHandle, build_id: &str) -> StreamSlot {
        let subscription = self.build_service.subscribe(build_id);
        let handle = subscription.handle();
        tokio::spawn(pump(session.clone(), subscription));
        StreamSlot {
            build_id: build_id.to_string(),
            handle,
        }
    }

    // ── User edits ──────────────────────────────────────────────────────────

    /// Runs one chat turn and applies the returned files. The first turn on an
    /// empty store replaces everything; later turns merge.
    pub async fn chat(&self, id: Uuid, message: &str) -> Result<ChatTurn, AppError> {
        if message.trim().is_empty() {
            return Err(AppError::Validation("message cannot be empty".to_string()));
        }
        let entry = self.entry(id).await?;

        let (prior_files, mode) = {
            let session = entry.session.read().await;
            if session.status().is_active() {
                return Err(SessionError::EditWhileBuilding(session.status()).into());
            }
            (session.files().files().to_vec(), session.apply_mode())
        };
        let history = entry.history.lock().await.clone();

        let request = ChatRequest {
            prior_files,
            message: message.to_string(),
            history,
        };
        let response = self.completion.complete(&request).await?;

        let changed = entry
            .session
            .write()
            .await
            .apply_generated(response.files, mode)?;

        let mut history = entry.history.lock().await;
        history.push(ChatMessage::user(message));
        history.push(ChatMessage::assistant(response.message.as_str()));
        let overflow = history.len().saturating_sub(MAX_HISTORY_MESSAGES);
        history.drain(..overflow);

        debug!("Chat turn on session {id} changed {} files ({mode:?})", changed.len());
        Ok(ChatTurn {
            message: response.message,
            files: changed,
            mode,
        })
    }

    pub async fn undo(&self, id: Uuid) -> Result<SessionView, AppError> {
        let entry = self.entry(id).await?;
        let mut session = entry.session.write().await;
        session.undo_last_edit()?;
        Ok(session.view())
    }

    pub async fn edit_file(
        &self,
        id: Uuid,
        path: &str,
        content: &str,
    ) -> Result<WriteOutcome, AppError> {
        let entry = self.entry(id).await?;
        let outcome = entry.session.write().await.edit_file(path, content)?;
        Ok(outcome)
    }

    pub async fn set_active(&self, id: Uuid, path: &str) -> Result<(), AppError> {
        if path.trim().is_empty() {
            return Err(AppError::Validation("path cannot be empty".to_string()));
        }
        let entry = self.entry(id).await?;
        entry.session.write().await.set_active(path);
        Ok(())
    }

    /// Files under `directory`, in store order.
    pub async fn list_files(
        &self,
        id: Uuid,
        directory: &str,
    ) -> Result<Vec<VirtualFile>, AppError> {
        let entry = self.entry(id).await?;
        let session = entry.session.read().await;
        Ok(session
            .files()
            .list_dir(directory)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn preview(&self, id: Uuid) -> Result<String, AppError> {
        let entry = self.entry(id).await?;
        let session = entry.session.read().await;
        Ok(preview::assemble(session.files()))
    }
}

async fn active_build_id(entry: &SessionEntry) -> Result<String, AppError> {
    let session = entry.session.read().await;
    session
        .build_id()
        .map(str::to_string)
        .ok_or_else(|| SessionError::NoActiveBuild.into())
}

// ────────────────────────────────────────────────────────────────────────────
// Stream pump
// ────────────────────────────────────────────────────────────────────────────

/// Applies subscription items until the stream ends or is closed. A closed
/// subscription never writes again, even if an item was already in hand.
async fn pump(session: SessionHandle, mut subscription: Subscription) {
    let handle = subscription.handle();
    let build_id = subscription.build_id().to_string();

    while let Some(item) = subscription.next().await {
        let mut session = session.write().await;
        if handle.is_closed() {
            return;
        }
        apply_stream_item(&mut session, &build_id, item);
    }

    let mut session = session.write().await;
    if handle.is_closed() {
        return;
    }
    subscription.close();
    if session.build_id() == Some(build_id.as_str()) {
        session.set_connection(ConnectionState::Disconnected);
    }
}

/// Folds one transport item into the session. Connection changes only apply to
/// the build the session is tracking.
fn apply_stream_item(
    session: &mut BuildSession,
    build_id: &str,
    item: StreamItem,
) -> Option<EventOutcome> {
    let connection = match item {
        StreamItem::Event(routed) => {
            let outcome = session.apply_routed(&routed);
            if outcome != EventOutcome::Applied {
                debug!("'{}' event for build {build_id}: {outcome:?}", routed.event.kind());
            }
            return Some(outcome);
        }
        StreamItem::Connected => ConnectionState::Connected,
        StreamItem::Reconnecting { .. } => ConnectionState::Reconnecting,
        StreamItem::Disconnected { .. } => ConnectionState::Disconnected,
    };
    if session.build_id() == Some(build_id) {
        session.set_connection(connection);
    }
    None
}
