//! Build Event Stream Consumer — folds one build event into a session.
//!
//! Application is synchronous and total. Every event kind has a defined effect or
//! a defined no-op, and unknown task ids, rejected transitions and duplicates are
//! absorbed here and logged at debug level. Nothing in this module returns an error.

use tracing::{debug, warn};

use crate::workspace::events::BuildEvent;
use crate::workspace::files::{FileWrite, WriteOutcome};
use crate::workspace::session::{BuildSession, BuildStatus};
use crate::workspace::tasks::{TaskGraph, Transition};

/// What an event did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Recognized, but the session already reflected it (duplicate or rejected transition).
    Unchanged,
    /// Liveness pings, unknown kinds, unknown task ids.
    Ignored,
    /// Belongs to a build other than the active one.
    Stale,
}

impl From<Transition> for EventOutcome {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Applied => EventOutcome::Applied,
            Transition::Unchanged | Transition::Rejected { .. } => EventOutcome::Unchanged,
            Transition::UnknownTask => EventOutcome::Ignored,
        }
    }
}

pub fn apply_event(session: &mut BuildSession, event: &BuildEvent) -> EventOutcome {
    match event {
        BuildEvent::PlanningCompleted { tasks } => {
            if matches!(session.status, BuildStatus::Completed | BuildStatus::Failed) {
                debug!("Ignoring replayed planning_completed after build finished");
                return EventOutcome::Unchanged;
            }
            session.status = BuildStatus::Building;
            session.tasks = TaskGraph::from_tasks(tasks.clone());
            EventOutcome::Applied
        }

        BuildEvent::TaskStarted { task_id } => {
            let transition = session.tasks.start(task_id);
            log_transition("task_started", task_id, transition);
            transition.into()
        }

        BuildEvent::FileWritten {
            path,
            content,
            language,
        } => {
            let write = FileWrite::new(path.as_str(), content.as_str()).with_language(*language);
            let path = write.path.clone();
            let outcome = match session.files.upsert(write) {
                Ok(WriteOutcome::Unchanged) => EventOutcome::Unchanged,
                Ok(_) => EventOutcome::Applied,
                Err(e) => {
                    warn!("Ignoring file_written event: {e}");
                    return EventOutcome::Ignored;
                }
            };
            if session.files.active().is_none() {
                session.files.set_active(&path);
            }
            outcome
        }

        BuildEvent::TaskCompleted { task_id } => {
            let transition = session.tasks.complete(task_id);
            log_transition("task_completed", task_id, transition);
            transition.into()
        }

        BuildEvent::TaskFailed { task_id, error } => {
            let transition = session.tasks.fail(task_id, error);
            log_transition("task_failed", task_id, transition);
            transition.into()
        }

        BuildEvent::TaskSkipped { task_id } => {
            let transition = session.tasks.skip(task_id);
            log_transition("task_skipped", task_id, transition);
            transition.into()
        }

        BuildEvent::BuildCompleted => {
            if session.status == BuildStatus::Completed {
                return EventOutcome::Unchanged;
            }
            session.status = BuildStatus::Completed;
            session.error = None;
            EventOutcome::Applied
        }

        BuildEvent::BuildFailed { error } => {
            if session.status == BuildStatus::Failed && session.error.as_deref() == Some(error) {
                return EventOutcome::Unchanged;
            }
            session.status = BuildStatus::Failed;
            session.error = Some(error.clone());
            EventOutcome::Applied
        }

        BuildEvent::CurrentState { tasks } => {
            let Some(tasks) = tasks else {
                return EventOutcome::Unchanged;
            };
            let graph = TaskGraph::from_tasks(tasks.clone());
            if graph == session.tasks {
                return EventOutcome::Unchanged;
            }
            session.tasks = graph;
            EventOutcome::Applied
        }

        BuildEvent::Ping => EventOutcome::Ignored,

        BuildEvent::Ignored { kind, reason } => {
            match reason {
                Some(reason) => debug!("Ignoring '{kind}' event: {reason}"),
                None => debug!("Ignoring unrecognized '{kind}' event"),
            }
            EventOutcome::Ignored
        }
    }
}

fn log_transition(kind: &str, task_id: &str, transition: Transition) {
    match transition {
        Transition::UnknownTask => {
            debug!("Ignoring {kind} for unknown task '{task_id}'");
        }
        Transition::Rejected { from, to } => {
            debug!("Ignoring {kind} for task '{task_id}': {from:?} -> {to:?} not allowed");
        }
        Transition::Applied | Transition::Unchanged => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::events::RoutedEvent;
    use crate::workspace::files::Language;
    use crate::workspace::tasks::{BuildTask, TaskStatus};

    fn planned_session() -> BuildSession {
        let mut session = BuildSession::new();
        session.start("b1");
        session.apply_event(&BuildEvent::PlanningCompleted {
            tasks: vec![
                BuildTask::new("t1", "Initialize Project"),
                BuildTask::new("t2", "Hero Section").depends_on(&["t1"]),
            ],
        });
        session
    }

    fn started(id: &str) -> BuildEvent {
        BuildEvent::TaskStarted { task_id: id.into() }
    }

    fn completed(id: &str) -> BuildEvent {
        BuildEvent::TaskCompleted { task_id: id.into() }
    }

    fn written(path: &str, content: &str) -> BuildEvent {
        BuildEvent::FileWritten {
            path: path.into(),
            content: content.into(),
            language: None,
        }
    }

    #[test]
    fn test_full_build_sequence() {
        let mut session = planned_session();
        assert_eq!(session.status(), BuildStatus::Building);

        let html = "<html><body>Jane Doe</body></html>";
        for event in [
            started("t1"),
            written("/index.html", html),
            completed("t1"),
            started("t2"),
            completed("t2"),
            BuildEvent::BuildCompleted,
        ] {
            session.apply_event(&event);
        }

        assert_eq!(session.status(), BuildStatus::Completed);
        assert!(session
            .tasks()
            .tasks()
            .iter()
            .all(|t| t.status == TaskStatus::Completed));
        assert_eq!(session.progress(), 1.0);
        assert_eq!(session.files().get("/index.html").unwrap().content, html);
        assert_eq!(session.files().active(), Some("/index.html"));
    }

    #[test]
    fn test_task_failure_then_restart_clears_error() {
        let mut session = planned_session();
        session.apply_event(&started("t1"));
        session.apply_event(&BuildEvent::TaskFailed {
            task_id: "t1".into(),
            error: "boom".into(),
        });
        let task = session.tasks().get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert_eq!(session.status(), BuildStatus::Building);

        assert_eq!(session.apply_event(&started("t1")), EventOutcome::Applied);
        let task = session.tasks().get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_unknown_task_ids_are_ignored() {
        let mut session = planned_session();
        let before = session.tasks().clone();
        assert_eq!(session.apply_event(&started("ghost")), EventOutcome::Ignored);
        assert_eq!(session.apply_event(&completed("ghost")), EventOutcome::Ignored);
        assert_eq!(session.tasks(), &before);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut session = planned_session();
        session.apply_event(&completed("t1"));
        session.apply_event(&written("/a.css", "a{}"));

        assert_eq!(session.apply_event(&completed("t1")), EventOutcome::Unchanged);
        assert_eq!(
            session.apply_event(&written("/a.css", "a{}")),
            EventOutcome::Unchanged
        );
        assert_eq!(session.files().get("/a.css").unwrap().version, 1);
    }

    #[test]
    fn test_failed_after_completed_is_ignored() {
        let mut session = planned_session();
        session.apply_event(&completed("t1"));
        let outcome = session.apply_event(&BuildEvent::TaskFailed {
            task_id: "t1".into(),
            error: "late".into(),
        });
        assert_eq!(outcome, EventOutcome::Unchanged);
        assert_eq!(session.tasks().get("t1").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_file_written_keeps_explicit_language_and_active_file() {
        let mut session = planned_session();
        session.set_active("/styles.css");
        session.apply_event(&BuildEvent::FileWritten {
            path: "components/Hero.tsx".into(),
            content: "export {}".into(),
            language: Some(Language::Javascript),
        });

        let file = session.files().get("/components/Hero.tsx").unwrap();
        assert_eq!(file.language, Language::Javascript);
        assert_eq!(session.files().active(), Some("/styles.css"));
    }

    #[test]
    fn test_file_written_with_empty_path_is_ignored() {
        let mut session = planned_session();
        assert_eq!(session.apply_event(&written("", "x")), EventOutcome::Ignored);
        assert_eq!(session.apply_event(&written("/", "x")), EventOutcome::Ignored);
        assert!(session.files().is_empty());
        assert!(session.files().active().is_none());
    }

    #[test]
    fn test_build_failed_records_message() {
        let mut session = planned_session();
        let failed = BuildEvent::BuildFailed {
            error: "Build stuck: dependencies failed".into(),
        };
        assert_eq!(session.apply_event(&failed), EventOutcome::Applied);
        assert_eq!(session.status(), BuildStatus::Failed);
        assert_eq!(session.error(), Some("Build stuck: dependencies failed"));
        assert_eq!(session.apply_event(&failed), EventOutcome::Unchanged);
    }

    #[test]
    fn test_task_failure_does_not_fail_build() {
        let mut session = planned_session();
        session.apply_event(&BuildEvent::TaskFailed {
            task_id: "t2".into(),
            error: "timeout".into(),
        });
        assert_eq!(session.status(), BuildStatus::Building);
        assert!(session.error().is_none());
    }

    #[test]
    fn test_current_state_replaces_tasks_but_not_files() {
        let mut session = planned_session();
        session.apply_event(&written("/index.html", "<p>kept</p>"));

        let mut done = BuildTask::new("t1", "Initialize Project");
        done.status = TaskStatus::Completed;
        let outcome = session.apply_event(&BuildEvent::CurrentState {
            tasks: Some(vec![done, BuildTask::new("t2", "Hero Section").depends_on(&["t1"])]),
        });

        assert_eq!(outcome, EventOutcome::Applied);
        assert_eq!(session.tasks().get("t1").unwrap().status, TaskStatus::Completed);
        assert_eq!(session.files().get("/index.html").unwrap().content, "<p>kept</p>");
        assert_eq!(
            session.apply_event(&BuildEvent::CurrentState { tasks: None }),
            EventOutcome::Unchanged
        );
    }

    #[test]
    fn test_replayed_planning_after_completion_does_not_regress() {
        let mut session = planned_session();
        session.apply_event(&completed("t1"));
        session.apply_event(&completed("t2"));
        session.apply_event(&BuildEvent::BuildCompleted);

        let outcome = session.apply_event(&BuildEvent::PlanningCompleted {
            tasks: vec![BuildTask::new("t1", "Initialize Project")],
        });

        assert_eq!(outcome, EventOutcome::Unchanged);
        assert_eq!(session.status(), BuildStatus::Completed);
        assert_eq!(session.tasks().len(), 2);
    }

    #[test]
    fn test_ping_and_unknown_kinds_are_ignored() {
        let mut session = planned_session();
        assert_eq!(session.apply_event(&BuildEvent::Ping), EventOutcome::Ignored);
        assert_eq!(
            session.apply_event(&BuildEvent::Ignored {
                kind: "build_phase_started".into(),
                reason: None
            }),
            EventOutcome::Ignored
        );
        assert_eq!(session.status(), BuildStatus::Building);
    }

    #[test]
    fn test_routed_events_for_active_build_apply() {
        let mut session = planned_session();
        let outcome = session.apply_routed(&RoutedEvent::new("b1", started("t1")));
        assert_eq!(outcome, EventOutcome::Applied);
        assert_eq!(session.tasks().get("t1").unwrap().status, TaskStatus::Running);
    }
}
