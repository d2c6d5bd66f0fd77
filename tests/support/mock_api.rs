//! In-process HTTP server standing in for the chat-completions API and the
//! scraped news sites. Tests script per-model replies up front, point the
//! engine at `url()`, and read back what the server saw.

use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One scripted answer to a chat-completions call.
#[derive(Debug, Clone)]
pub enum ChatScript {
    /// HTTP 200 with the given assistant content and token usage.
    Reply {
        content: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// A bare HTTP status with a plain-text body.
    Status { code: u16, body: String },
}

impl ChatScript {
    pub fn reply(content: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        ChatScript::Reply {
            content: content.into(),
            input_tokens,
            output_tokens,
        }
    }

    pub fn status(code: u16, body: impl Into<String>) -> Self {
        ChatScript::Status {
            code,
            body: body.into(),
        }
    }
}

struct ChatRoute {
    model: String,
    needle: String,
    script: ChatScript,
}

#[derive(Default)]
struct ApiState {
    pages: HashMap<String, String>,
    queues: HashMap<String, VecDeque<ChatScript>>,
    routes: Vec<ChatRoute>,
    models_called: Vec<String>,
}

/// Scripted server state, shared between the test body and the serving tasks.
///
/// Chat calls are answered from the per-model queue first, then from the
/// first route whose needle appears in the user message, and fail with a 500
/// when nothing is scripted. Every `GET` serves a registered page or a 404.
#[derive(Clone, Default)]
pub struct MockApi {
    state: Arc<Mutex<ApiState>>,
    chat_requests: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    chat_delay_ms: Arc<AtomicU64>,
    page_delay_ms: Arc<AtomicU64>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the HTML served for `GET path`.
    pub fn serve_page(&self, path: impl Into<String>, html: impl Into<String>) {
        let mut state = self.lock_state();
        state.pages.insert(path.into(), html.into());
    }

    /// Queues one reply for `model`; queued replies are consumed in order
    /// before any route is consulted.
    pub fn enqueue_chat(&self, model: impl Into<String>, script: ChatScript) {
        let mut state = self.lock_state();
        state.queues.entry(model.into()).or_default().push_back(script);
    }

    /// Adds a persistent reply for `model` taken whenever `needle` appears in
    /// the user message. Routes match in insertion order; an empty needle
    /// matches everything, so it works as a catch-all when added last.
    pub fn route_chat(
        &self,
        model: impl Into<String>,
        needle: impl Into<String>,
        script: ChatScript,
    ) {
        let mut state = self.lock_state();
        state.routes.push(ChatRoute {
            model: model.into(),
            needle: needle.into(),
            script,
        });
    }

    /// Delays every chat reply, for tests that need calls to overlap.
    pub fn set_chat_delay(&self, delay: Duration) {
        self.chat_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delays every page response, for fetch timeout tests.
    pub fn set_page_delay(&self, delay: Duration) {
        self.page_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn chat_requests(&self) -> usize {
        self.chat_requests.load(Ordering::SeqCst)
    }

    /// Highest number of chat calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Model names in the order the server received chat calls.
    pub fn models_called(&self) -> Vec<String> {
        self.lock_state().models_called.clone()
    }

    fn resolve_chat(&self, payload: &Value) -> ChatScript {
        let model = payload["model"].as_str().unwrap_or_default().to_string();
        let user = payload["messages"]
            .as_array()
            .and_then(|messages| {
                messages
                    .iter()
                    .find(|message| message["role"] == "user")
                    .and_then(|message| message["content"].as_str())
            })
            .unwrap_or_default()
            .to_string();

        let mut state = self.lock_state();
        state.models_called.push(model.clone());

        if let Some(script) = state
            .queues
            .get_mut(&model)
            .and_then(|queue| queue.pop_front())
        {
            return script;
        }
        if let Some(route) = state
            .routes
            .iter()
            .find(|route| route.model == model && user.contains(&route.needle))
        {
            return route.script.clone();
        }
        ChatScript::status(500, format!("no scripted reply for model {model}"))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ApiState> {
        self.state.lock().expect("mock API state poisoned")
    }
}

/// The listening side of [`MockApi`]: binds an ephemeral port and serves
/// until shut down.
pub struct MockApiServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockApiServer {
    pub async fn start(api: MockApi) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock API should bind an ephemeral port");
        let addr = listener.local_addr().expect("mock API listener address");
        let std_listener = listener.into_std().expect("mock API std listener");
        std_listener
            .set_nonblocking(true)
            .expect("mock API non-blocking listener");

        let make_service = make_service_fn(move |_| {
            let api = api.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    serve_request(api.clone(), request)
                }))
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = Server::from_tcp(std_listener)
            .expect("mock API server over the bound listener")
            .serve(make_service)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("mock API server error: {err}");
            }
        });

        Self {
            url: format!("http://{addr}"),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(api: MockApi, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let path = request.uri().path().to_string();
    let response = if request.method() == Method::POST && path.ends_with("/chat/completions") {
        handle_chat(api, request).await
    } else if request.method() == Method::GET {
        handle_page(&api, &path).await
    } else {
        plain_response(StatusCode::METHOD_NOT_ALLOWED, "unsupported method")
    };
    Ok(response)
}

async fn handle_chat(api: MockApi, request: Request<Body>) -> Response<Body> {
    api.chat_requests.fetch_add(1, Ordering::SeqCst);
    let in_flight = api.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    api.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("Bearer "))
        .unwrap_or(false);

    let script = if !authorized {
        ChatScript::status(401, "missing bearer token")
    } else {
        match hyper::body::to_bytes(request.into_body()).await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(payload) => api.resolve_chat(&payload),
                Err(_) => ChatScript::status(400, "request body was not JSON"),
            },
            Err(_) => ChatScript::status(400, "request body was unreadable"),
        }
    };

    let delay = Duration::from_millis(api.chat_delay_ms.load(Ordering::SeqCst));
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    api.in_flight.fetch_sub(1, Ordering::SeqCst);

    match script {
        ChatScript::Reply {
            content,
            input_tokens,
            output_tokens,
        } => json_response(
            StatusCode::OK,
            &json!({
                "choices": [{ "message": { "role": "assistant", "content": content } }],
                "usage": { "prompt_tokens": input_tokens, "completion_tokens": output_tokens },
            }),
        ),
        ChatScript::Status { code, body } => plain_response(
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            &body,
        ),
    }
}

async fn handle_page(api: &MockApi, path: &str) -> Response<Body> {
    let delay = Duration::from_millis(api.page_delay_ms.load(Ordering::SeqCst));
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let state = api.lock_state();
    match state.pages.get(path) {
        Some(html) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(html.clone()))
            .expect("mock API page response"),
        None => plain_response(StatusCode::NOT_FOUND, "no such page"),
    }
}

fn json_response(status: StatusCode, payload: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .expect("mock API json response")
}

fn plain_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from(body.to_string()))
        .expect("mock API plain response")
}
