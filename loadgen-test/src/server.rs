//! Exposes an in-process fake inference server for use in integration tests.
//!
//! The server mimics a sentiment-classification deployment: `POST /infer` accepts
//! `{"inputs": [...]}` (or `{"text": "..."}`) and responds with one `{"label", "confidence"}`
//! prediction per input. Latency and failure modes are configurable through [`Behavior`].
//!
//! ```
//! use loadgen_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    let url = server.url("/infer");
//!    // use the URL in tests...
//! }
//! ```

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Words that make the fake model classify an input as negative.
const NEGATIVE_WORDS: &[&str] = &["awful", "hate", "terrible", "not", "bad"];

/// How the fake inference endpoint responds.
#[derive(Clone, Debug)]
pub struct Behavior {
    /// Delay before every response.
    pub latency: Duration,
    /// Status code of every `/infer` response.
    pub status: StatusCode,
    /// Whether successful responses carry a JSON body and content type.
    pub json: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            status: StatusCode::OK,
            json: true,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    behavior: Behavior,
    requests: AtomicU64,
}

/// An in-process fake inference server for use in integration tests.
///
/// It listens on a random available port on localhost and stops when dropped.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    /// Starts a server that answers every request immediately and successfully.
    pub async fn new() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    /// Starts a server with the given behavior.
    pub async fn with_behavior(behavior: Behavior) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let state = Arc::new(ServerState {
            behavior,
            requests: AtomicU64::new(0),
        });
        let app = Router::new()
            .route("/infer", post(infer))
            .route("/echo", post(echo))
            .route("/health", get(health))
            .with_state(Arc::clone(&state));

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            state,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// Returns the number of requests that reached `/infer` or `/echo`.
    pub fn requests(&self) -> u64 {
        self.state.requests.load(Ordering::Relaxed)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Deserialize)]
struct InferRequest {
    #[serde(default)]
    inputs: Option<Vec<String>>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct Prediction {
    label: &'static str,
    confidence: f64,
}

fn classify(text: &str) -> Prediction {
    let lowercase = text.to_lowercase();
    let negative = lowercase
        .split_whitespace()
        .any(|word| NEGATIVE_WORDS.contains(&word));

    Prediction {
        label: if negative { "NEGATIVE" } else { "POSITIVE" },
        confidence: 0.99,
    }
}

async fn respond(state: &ServerState, body: impl Serialize) -> Response {
    state.requests.fetch_add(1, Ordering::Relaxed);
    let behavior = &state.behavior;
    if !behavior.latency.is_zero() {
        tokio::time::sleep(behavior.latency).await;
    }

    if behavior.status != StatusCode::OK {
        return (behavior.status, "inference failed").into_response();
    }
    if !behavior.json {
        return (StatusCode::OK, "ok").into_response();
    }
    Json(body).into_response()
}

async fn infer(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<InferRequest>,
) -> Response {
    let texts = match (request.inputs, request.text) {
        (Some(inputs), _) => inputs,
        (None, Some(text)) => vec![text],
        (None, None) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, "missing inputs").into_response();
        }
    };

    let predictions: Vec<_> = texts.iter().map(|text| classify(text)).collect();
    respond(&state, predictions).await
}

async fn echo(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    respond(&state, serde_json::json!({ "echo": body })).await
}

async fn health() -> StatusCode {
    StatusCode::OK
}
