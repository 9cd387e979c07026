//! Build Service — the remote planner/executor that owns builds.
//!
//! Commands (start, retry, regenerate) are plain JSON requests. Their effects are
//! never applied locally: the session only changes when the resulting events come
//! back over the stream opened by [`BuildService::subscribe`].
//!
//! `AppState` holds an `Arc<dyn BuildService>`; tests swap in an in-process stub.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

pub mod stream;

pub use stream::{StreamItem, StreamTransport, Subscription, SubscriptionHandle};

use crate::build_service::stream::{StreamOptions, StreamSource};

const BUILD_PREFIX: &str = "/api/build";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BuildServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Build service rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed build service response: {0}")]
    Malformed(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Wire models
// ────────────────────────────────────────────────────────────────────────────

/// Parameters forwarded verbatim when a build starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartBuildRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<String>>,
}

fn default_style() -> String {
    "modern".to_string()
}

/// Acknowledgement of a started build. Its `status` is informational only.
#[derive(Debug, Clone, Deserialize)]
pub struct StartedBuild {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

// ────────────────────────────────────────────────────────────────────────────
// Trait definition
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait BuildService: Send + Sync {
    async fn start_build(&self, request: &StartBuildRequest)
        -> Result<StartedBuild, BuildServiceError>;

    async fn retry_task(&self, build_id: &str, task_id: &str) -> Result<(), BuildServiceError>;

    async fn regenerate_section(
        &self,
        build_id: &str,
        section_id: &str,
        prompt: Option<&str>,
    ) -> Result<(), BuildServiceError>;

    /// Opens the event stream for `build_id`. The first event delivered is the
    /// service's `current_state` snapshot.
    fn subscribe(&self, build_id: &str) -> Subscription;
}

// ────────────────────────────────────────────────────────────────────────────
// HttpBuildService
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpBuildService {
    client: Client,
    stream_client: Client,
    base_url: String,
    token: Option<String>,
    transport: StreamTransport,
    stream_options: StreamOptions,
}

impl HttpBuildService {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        transport: StreamTransport,
        max_reconnects: u32,
    ) -> Result<Self, BuildServiceError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        // Streams stay open for the whole build, so only connecting is bounded.
        let stream_client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            transport,
            stream_options: StreamOptions {
                max_reconnects,
                ..StreamOptions::default()
            },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{BUILD_PREFIX}{path}", self.base_url)
    }

    /// The same route on the `ws`/`wss` scheme.
    fn websocket_url(&self, path: &str) -> String {
        let url = self.url(path);
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Response, BuildServiceError> {
        let response = self
            .authorize(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl BuildService for HttpBuildService {
    async fn start_build(
        &self,
        request: &StartBuildRequest,
    ) -> Result<StartedBuild, BuildServiceError> {
        let body = serde_json::to_value(request)
            .map_err(|e| BuildServiceError::Malformed(e.to_string()))?;
        let response = self.post("/start", &body).await?;
        let started: StartedBuild = response
            .json()
            .await
            .map_err(|e| BuildServiceError::Malformed(e.to_string()))?;

        info!("Build service started build {}", started.id);
        Ok(started)
    }

    async fn retry_task(&self, build_id: &str, task_id: &str) -> Result<(), BuildServiceError> {
        self.post(&format!("/{build_id}/retry"), &json!({ "task_id": task_id }))
            .await?;
        debug!("Retry requested for task {task_id} of build {build_id}");
        Ok(())
    }

    async fn regenerate_section(
        &self,
        build_id: &str,
        section_id: &str,
        prompt: Option<&str>,
    ) -> Result<(), BuildServiceError> {
        self.post(
            &format!("/{build_id}/regenerate"),
            &json!({ "section_id": section_id, "new_prompt": prompt }),
        )
        .await?;
        debug!("Regeneration requested for section {section_id} of build {build_id}");
        Ok(())
    }

    fn subscribe(&self, build_id: &str) -> Subscription {
        let source = match self.transport {
            StreamTransport::WebSocket => StreamSource::WebSocket {
                url: self.websocket_url(&format!("/{build_id}/stream")),
                token: self.token.clone(),
            },
            StreamTransport::Sse => StreamSource::Sse(
                self.authorize(
                    self.stream_client
                        .get(self.url(&format!("/{build_id}/events")))
                        .header(reqwest::header::ACCEPT, "text/event-stream"),
                ),
            ),
        };
        debug!("Subscribing to build {build_id} over {:?}", self.transport);
        stream::subscribe(source, build_id, self.stream_options.clone())
    }
}

/// Turns non-2xx responses into [`BuildServiceError::Rejected`] with the best
/// message the body offers.
async fn check_status(response: Response) -> Result<Response, BuildServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BuildServiceError::Rejected {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

fn error_message(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) else {
        return body.trim().to_string();
    };
    let value = parsed.detail.or(parsed.error);
    match value {
        Some(Value::String(s)) => s,
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map).to_string()),
        Some(other) => other.to_string(),
        None => body.trim().to_string(),
    }
}
