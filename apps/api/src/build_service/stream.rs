//! Build event stream — a cancellable subscription to one build's events.
//!
//! Two transports carry the same `{type, data, timestamp}` envelopes: a WebSocket
//! with one envelope per text message, or server-sent events with one per `data`
//! frame. `subscribe` spawns one reader task per build. The task decodes frames into
//! [`RoutedEvent`]s and owns the reconnect loop: consecutive failures are retried
//! with exponential backoff up to `max_reconnects`, then the subscription reports
//! `Disconnected` and ends. A terminal build event also ends it, without reconnecting.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{future, StreamExt};
use reqwest::RequestBuilder;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as WsRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::workspace::events::{decode_event, RoutedEvent};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    Connect(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Bearer token is not a valid header value")]
    InvalidToken,

    #[error("Event stream returned status {0}")]
    Status(u16),

    #[error("Event stream closed by server")]
    Closed,

    #[error("Stream request cannot be replayed")]
    NotReplayable,
}

/// Wire transport for build events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamTransport {
    #[default]
    WebSocket,
    Sse,
}

impl FromStr for StreamTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(StreamTransport::WebSocket),
            "sse" => Ok(StreamTransport::Sse),
            other => Err(format!("unknown stream transport '{other}' (expected websocket or sse)")),
        }
    }
}

/// Where a subscription connects. Reopened on every reconnect attempt.
pub enum StreamSource {
    /// `GET` answered with `text/event-stream`. The request must be replayable.
    Sse(RequestBuilder),
    WebSocket { url: String, token: Option<String> },
}

impl StreamSource {
    /// An owned, ready-to-send attempt. Built synchronously so no borrow of the
    /// source is held across the connect.
    fn attempt(&self) -> Result<Attempt, StreamError> {
        match self {
            StreamSource::Sse(request) => request
                .try_clone()
                .map(Attempt::Sse)
                .ok_or(StreamError::NotReplayable),
            StreamSource::WebSocket { url, token } => {
                let mut request = url.as_str().into_client_request()?;
                if let Some(token) = token {
                    let value = HeaderValue::from_str(&format!("Bearer {token}"))
                        .map_err(|_| StreamError::InvalidToken)?;
                    request.headers_mut().insert(AUTHORIZATION, value);
                }
                Ok(Attempt::WebSocket(request))
            }
        }
    }
}

enum Attempt {
    Sse(RequestBuilder),
    WebSocket(WsRequest),
}

/// Decoded text frames of one connection, each holding one event envelope.
type Frames = BoxStream<'static, Result<String, StreamError>>;

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub max_reconnects: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub buffer: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            buffer: 64,
        }
    }
}

impl StreamOptions {
    /// Delay before reconnect attempt `attempt` (1-based): 500ms, 1s, 2s, ... capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// What a subscription yields, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Connected,
    Event(RoutedEvent),
    Reconnecting { attempt: u32, reason: String },
    /// Reconnects exhausted. Nothing follows.
    Disconnected { reason: String },
}

// ────────────────────────────────────────────────────────────────────────────
// Subscription
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable close switch for a [`Subscription`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    cancel: Arc<watch::Sender<bool>>,
}

impl SubscriptionHandle {
    /// Stops delivery. Idempotent.
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

pub struct Subscription {
    build_id: String,
    items: mpsc::Receiver<StreamItem>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Wraps a receiver fed by any producer.
    pub fn new(build_id: impl Into<String>, items: mpsc::Receiver<StreamItem>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            build_id: build_id.into(),
            items,
            handle: SubscriptionHandle {
                cancel: Arc::new(cancel),
            },
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn close(&self) {
        self.handle.close();
    }

    /// Next item, or `None` once the stream ended or was closed.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.handle.is_closed() {
            return None;
        }
        tokio::select! {
            item = self.items.recv() => item,
            _ = self.handle.closed() => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reader task
// ────────────────────────────────────────────────────────────────────────────

enum StreamEnd {
    Terminal,
    ReceiverDropped,
    Lost(StreamError),
}

/// Opens a subscription that connects to `source` and reconnects per `options`.
pub fn subscribe(source: StreamSource, build_id: &str, options: StreamOptions) -> Subscription {
    let (tx, rx) = mpsc::channel(options.buffer.max(1));
    let subscription = Subscription::new(build_id, rx);
    let handle = subscription.handle();
    let build_id = build_id.to_string();

    tokio::spawn(async move {
        tokio::select! {
            _ = run(source, &build_id, &options, &tx) => {}
            _ = handle.closed() => debug!("Subscription to build {build_id} closed"),
        }
    });

    subscription
}

async fn run(
    source: StreamSource,
    build_id: &str,
    options: &StreamOptions,
    tx: &mpsc::Sender<StreamItem>,
) {
    let mut failures: u32 = 0;
    loop {
        let attempt = source.attempt();
        let opened = match attempt {
            Ok(attempt) => connect(attempt).await,
            Err(e) => Err(e),
        };
        let reason = match opened {
            Ok(frames) => {
                if tx.send(StreamItem::Connected).await.is_err() {
                    return;
                }
                let (end, delivered) = read_events(frames, build_id, tx).await;
                if delivered > 0 {
                    failures = 0;
                }
                match end {
                    StreamEnd::Terminal | StreamEnd::ReceiverDropped => return,
                    StreamEnd::Lost(e) => e,
                }
            }
            Err(e) => e,
        };

        failures += 1;
        if failures > options.max_reconnects {
            warn!(
                "Giving up on event stream for build {build_id} after {} reconnects: {reason}",
                options.max_reconnects
            );
            let _ = tx
                .send(StreamItem::Disconnected {
                    reason: reason.to_string(),
                })
                .await;
            return;
        }

        let delay = options.backoff(failures);
        warn!(
            "Event stream for build {build_id} lost ({reason}), reconnect {failures}/{} in {}ms",
            options.max_reconnects,
            delay.as_millis()
        );
        let reconnecting = StreamItem::Reconnecting {
            attempt: failures,
            reason: reason.to_string(),
        };
        if tx.send(reconnecting).await.is_err() {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

async fn connect(attempt: Attempt) -> Result<Frames, StreamError> {
    match attempt {
        Attempt::Sse(request) => {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(StreamError::Status(status.as_u16()));
            }
            let mut decoder = SseDecoder::default();
            let frames = response.bytes_stream().flat_map(move |chunk| {
                let frames: Vec<Result<String, StreamError>> = match chunk {
                    Ok(chunk) => decoder.push(&chunk).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e.into())],
                };
                stream::iter(frames)
            });
            Ok(frames.boxed())
        }
        Attempt::WebSocket(request) => {
            let (socket, _) = tokio_tungstenite::connect_async(request).await?;
            // Pings are answered by the socket itself; a close frame ends the stream.
            let frames = socket.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                    Ok(_) => None,
                    Err(e) => Some(Err(StreamError::WebSocket(e))),
                })
            });
            Ok(frames.boxed())
        }
    }
}

async fn read_events(
    mut frames: Frames,
    build_id: &str,
    tx: &mpsc::Sender<StreamItem>,
) -> (StreamEnd, usize) {
    let mut delivered = 0;

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return (StreamEnd::Lost(e), delivered),
        };
        let decoded = decode_event(&frame);
        let terminal = decoded.event.is_terminal();
        let routed = RoutedEvent {
            timestamp: decoded.timestamp,
            ..RoutedEvent::new(build_id, decoded.event)
        };
        if tx.send(StreamItem::Event(routed)).await.is_err() {
            return (StreamEnd::ReceiverDropped, delivered);
        }
        delivered += 1;
        if terminal {
            debug!("Build {build_id} reached a terminal event, closing stream");
            return (StreamEnd::Terminal, delivered);
        }
    }

    (StreamEnd::Lost(StreamError::Closed), delivered)
}

// ────────────────────────────────────────────────────────────────────────────
// SSE framing
// ────────────────────────────────────────────────────────────────────────────

/// Incremental `text/event-stream` decoder yielding the `data` of each frame.
/// Comment lines (`:`) and fields other than `data` are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    frames.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
    use axum::{
        http::{header, HeaderMap},
        routing::get,
        Router,
    };

    use super::*;
    use crate::workspace::events::BuildEvent;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_options(max_reconnects: u32) -> StreamOptions {
        StreamOptions {
            max_reconnects,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            buffer: 16,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn collect(mut subscription: Subscription) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = tokio::time::timeout(WAIT, subscription.next())
            .await
            .expect("stream stalled")
        {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_decoder_handles_split_chunks_and_comments() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b": keepalive\n\ndata: {\"type\":").is_empty());
        let frames = decoder.push(b"\"ping\"}\n\nevent: x\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(frames, vec![r#"{"type":"ping"}"#.to_string(), "a\nb".to_string()]);
    }

    #[test]
    fn test_decoder_keeps_multibyte_text_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: café\n\n".as_bytes();
        let (head, tail) = bytes.split_at(10);
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec!["café".to_string()]);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let options = StreamOptions::default();
        assert_eq!(options.backoff(1), Duration::from_millis(500));
        assert_eq!(options.backoff(2), Duration::from_secs(1));
        assert_eq!(options.backoff(3), Duration::from_secs(2));
        assert_eq!(options.backoff(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_subscription_delivers_events_until_terminal() {
        let body = concat!(
            ": connected\n\n",
            "data: {\"type\":\"current_state\",\"data\":{\"tasks\":[]}}\n\n",
            "data: {\"type\":\"task_started\",\"data\":{\"task_id\":\"t1\"}}\n\n",
            "data: {\"type\":\"build_completed\",\"data\":{}}\n\n",
            "data: {\"type\":\"ping\"}\n\n",
        );
        let base = serve(Router::new().route(
            "/events",
            get(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
        ))
        .await;

        let request = reqwest::Client::new().get(format!("{base}/events"));
        let items = collect(subscribe(StreamSource::Sse(request), "b1", fast_options(2))).await;

        assert_eq!(items.len(), 4);
        assert_eq!(items[0], StreamItem::Connected);
        let StreamItem::Event(first) = &items[1] else {
            panic!("expected an event");
        };
        assert_eq!(first.build_id, "b1");
        assert_eq!(first.event, BuildEvent::CurrentState { tasks: Some(vec![]) });
        assert_eq!(
            items[3],
            StreamItem::Event(RoutedEvent::new("b1", BuildEvent::BuildCompleted))
        );
    }

    #[tokio::test]
    async fn test_reconnects_are_bounded() {
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        let base = serve(Router::new().route(
            "/events",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ([(header::CONTENT_TYPE, "text/event-stream")], "")
                }
            }),
        ))
        .await;

        let request = reqwest::Client::new().get(format!("{base}/events"));
        let items = collect(subscribe(StreamSource::Sse(request), "b1", fast_options(2))).await;

        assert_eq!(connections.load(Ordering::SeqCst), 3);
        assert_eq!(
            items.iter().filter(|i| **i == StreamItem::Connected).count(),
            3
        );
        assert!(matches!(
            items[1],
            StreamItem::Reconnecting { attempt: 1, .. }
        ));
        assert!(matches!(
            items.last(),
            Some(StreamItem::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_error_status_counts_as_failure() {
        let base = serve(Router::new()).await;

        let request = reqwest::Client::new().get(format!("{base}/events"));
        let items = collect(subscribe(StreamSource::Sse(request), "b1", fast_options(1))).await;

        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], StreamItem::Reconnecting { attempt: 1, .. }));
        let StreamItem::Disconnected { reason } = &items[1] else {
            panic!("expected disconnect");
        };
        assert!(reason.contains("404"));
    }

    fn websocket(base: &str, path: &str, token: Option<&str>) -> StreamSource {
        StreamSource::WebSocket {
            url: format!("{}{path}", base.replacen("http://", "ws://", 1)),
            token: token.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_websocket_delivers_events_until_terminal() {
        let frames = [
            r#"{"type":"current_state","data":{"id":"b1","task_graph":{"tasks":[]}}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"file_written","data":{"path":"/index.html","content":"<h1>Hi</h1>"}}"#,
            r#"{"type":"build_completed","data":{}}"#,
            r#"{"type":"task_started","data":{"task_id":"late"}}"#,
        ];
        let base = serve(Router::new().route(
            "/api/build/b1/stream",
            get(move |ws: WebSocketUpgrade, headers: HeaderMap| async move {
                let authorized = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer secret");
                ws.on_upgrade(move |mut socket| async move {
                    if !authorized {
                        return;
                    }
                    for frame in frames {
                        if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                    // Keep the socket open; the client ends on the terminal event.
                    while socket.recv().await.is_some() {}
                })
            }),
        ))
        .await;

        let source = websocket(&base, "/api/build/b1/stream", Some("secret"));
        let items = collect(subscribe(source, "b1", fast_options(2))).await;

        assert_eq!(items.len(), 5);
        assert_eq!(items[0], StreamItem::Connected);
        assert_eq!(
            items[1],
            StreamItem::Event(RoutedEvent::new(
                "b1",
                BuildEvent::CurrentState { tasks: Some(vec![]) }
            ))
        );
        assert_eq!(items[2], StreamItem::Event(RoutedEvent::new("b1", BuildEvent::Ping)));
        assert_eq!(
            items[3],
            StreamItem::Event(RoutedEvent::new(
                "b1",
                BuildEvent::FileWritten {
                    path: "/index.html".to_string(),
                    content: "<h1>Hi</h1>".to_string(),
                    language: None,
                }
            ))
        );
        assert_eq!(
            items[4],
            StreamItem::Event(RoutedEvent::new("b1", BuildEvent::BuildCompleted))
        );
    }

    #[tokio::test]
    async fn test_websocket_reconnects_are_bounded() {
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        let base = serve(Router::new().route(
            "/stream",
            get(move |ws: WebSocketUpgrade| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ws.on_upgrade(|mut socket| async move {
                        let _ = socket.send(WsMessage::Close(None)).await;
                    })
                }
            }),
        ))
        .await;

        let source = websocket(&base, "/stream", None);
        let items = collect(subscribe(source, "b1", fast_options(1))).await;

        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert_eq!(
            items.iter().filter(|i| **i == StreamItem::Connected).count(),
            2
        );
        assert!(matches!(items.last(), Some(StreamItem::Disconnected { .. })));
    }

    #[test]
    fn test_transport_names() {
        assert_eq!("websocket".parse::<StreamTransport>(), Ok(StreamTransport::WebSocket));
        assert_eq!(" SSE ".parse::<StreamTransport>(), Ok(StreamTransport::Sse));
        assert!("grpc".parse::<StreamTransport>().is_err());
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let (tx, rx) = mpsc::channel(4);
        let mut subscription = Subscription::new("b1", rx);
        tx.send(StreamItem::Connected).await.unwrap();
        assert_eq!(subscription.next().await, Some(StreamItem::Connected));

        let handle = subscription.handle();
        handle.close();
        tx.send(StreamItem::Connected).await.unwrap();

        assert!(handle.is_closed());
        assert_eq!(subscription.next().await, None);
    }
}
