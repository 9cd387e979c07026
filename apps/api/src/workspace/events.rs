//! Build events — the only channel through which a running build mutates a session.
//!
//! The build service sends JSON envelopes `{type, data, timestamp?}` with untyped
//! `data`. They are decoded once, here, into the closed `BuildEvent` sum type.
//! Anything that does not fit becomes `BuildEvent::Ignored`, never an error.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::workspace::files::Language;
use crate::workspace::tasks::BuildTask;

#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    PlanningCompleted {
        tasks: Vec<BuildTask>,
    },
    TaskStarted {
        task_id: String,
    },
    FileWritten {
        path: String,
        content: String,
        language: Option<Language>,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskSkipped {
        task_id: String,
    },
    BuildCompleted,
    BuildFailed {
        error: String,
    },
    /// Replay sent on (re)connect. Files are never part of it.
    CurrentState {
        tasks: Option<Vec<BuildTask>>,
    },
    Ping,
    Ignored {
        kind: String,
        reason: Option<String>,
    },
}

impl BuildEvent {
    pub fn kind(&self) -> &str {
        match self {
            BuildEvent::PlanningCompleted { .. } => "planning_completed",
            BuildEvent::TaskStarted { .. } => "task_started",
            BuildEvent::FileWritten { .. } => "file_written",
            BuildEvent::TaskCompleted { .. } => "task_completed",
            BuildEvent::TaskFailed { .. } => "task_failed",
            BuildEvent::TaskSkipped { .. } => "task_skipped",
            BuildEvent::BuildCompleted => "build_completed",
            BuildEvent::BuildFailed { .. } => "build_failed",
            BuildEvent::CurrentState { .. } => "current_state",
            BuildEvent::Ping => "ping",
            BuildEvent::Ignored { kind, .. } => kind,
        }
    }

    /// The build service closes the stream after one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildEvent::BuildCompleted | BuildEvent::BuildFailed { .. }
        )
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event: BuildEvent,
    pub timestamp: Option<DateTime<Utc>>,
}

/// An event tagged with the build id of the stream it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub build_id: String,
    pub event: BuildEvent,
    pub timestamp: Option<DateTime<Utc>>,
}

impl RoutedEvent {
    pub fn new(build_id: impl Into<String>, event: BuildEvent) -> Self {
        Self {
            build_id: build_id.into(),
            event,
            timestamp: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TasksPayload {
    tasks: Vec<BuildTask>,
}

#[derive(Debug, Deserialize)]
struct TaskRef {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskFailure {
    task_id: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilePayload {
    path: String,
    content: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BuildFailure {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatePayload {
    #[serde(default)]
    tasks: Option<Vec<BuildTask>>,
    #[serde(default)]
    task_graph: Option<TasksPayload>,
}

/// Decodes one JSON text frame.
pub fn decode_event(text: &str) -> DecodedEvent {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => decode_value(value),
        Err(e) => DecodedEvent {
            event: BuildEvent::Ignored {
                kind: "<malformed>".to_string(),
                reason: Some(e.to_string()),
            },
            timestamp: None,
        },
    }
}

pub fn decode_value(value: Value) -> DecodedEvent {
    let raw: RawEnvelope = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            return DecodedEvent {
                event: BuildEvent::Ignored {
                    kind: "<malformed>".to_string(),
                    reason: Some(e.to_string()),
                },
                timestamp: None,
            }
        }
    };

    let timestamp = raw.timestamp.as_ref().and_then(parse_timestamp);
    let event = decode_payload(&raw.kind, raw.data).unwrap_or_else(|reason| BuildEvent::Ignored {
        kind: raw.kind.clone(),
        reason: Some(reason),
    });

    DecodedEvent { event, timestamp }
}

fn decode_payload(kind: &str, data: Value) -> Result<BuildEvent, String> {
    let event = match kind {
        "planning_completed" => {
            let p: TasksPayload = payload(data)?;
            BuildEvent::PlanningCompleted { tasks: p.tasks }
        }
        "task_started" => BuildEvent::TaskStarted {
            task_id: payload::<TaskRef>(data)?.task_id,
        },
        "file_written" => {
            let p: FilePayload = payload(data)?;
            BuildEvent::FileWritten {
                language: p.language.as_deref().and_then(Language::from_name),
                path: p.path,
                content: p.content,
            }
        }
        "task_completed" => BuildEvent::TaskCompleted {
            task_id: payload::<TaskRef>(data)?.task_id,
        },
        "task_failed" => {
            let p: TaskFailure = payload(data)?;
            BuildEvent::TaskFailed {
                task_id: p.task_id,
                error: p.error.unwrap_or_default(),
            }
        }
        "task_skipped" => BuildEvent::TaskSkipped {
            task_id: payload::<TaskRef>(data)?.task_id,
        },
        "build_completed" => BuildEvent::BuildCompleted,
        "build_failed" => {
            let p: BuildFailure = payload_or_default(data)?;
            BuildEvent::BuildFailed {
                error: p
                    .error
                    .or(p.message)
                    .unwrap_or_else(|| "Build failed".to_string()),
            }
        }
        "current_state" => {
            let p: StatePayload = payload_or_default(data)?;
            BuildEvent::CurrentState {
                tasks: p.tasks.or(p.task_graph.map(|g| g.tasks)),
            }
        }
        "ping" => BuildEvent::Ping,
        other => BuildEvent::Ignored {
            kind: other.to_string(),
            reason: None,
        },
    };
    Ok(event)
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|e| format!("invalid payload: {e}"))
}

fn payload_or_default<T: DeserializeOwned + Default>(data: Value) -> Result<T, String> {
    if data.is_null() {
        return Ok(T::default());
    }
    payload(data)
}

/// Accepts RFC 3339, or naive ISO-8601 read as UTC.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
