use std::sync::Arc;

use crate::sessions::SessionRegistry;

/// Shared application state injected into all route handlers via Axum extractors.
///
/// The registry carries the pluggable boundaries: `Arc<dyn BuildService>` and
/// `Arc<dyn CompletionService>`, swapped for in-process stubs in tests.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
}
