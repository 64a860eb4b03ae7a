//! XML-RPC callback listener.
//!
//! One listener serves one TCP port. It moves through
//! `Stopped → Starting → Running → Stopping → Stopped`; `stop` is a no-op
//! on a listener that is not running and is bounded by [`STOP_TIMEOUT`].

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header, Request},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use hmbridge_xmlrpc::{encode_fault, encode_response, parse_method_call, Fault, FAULT_PARSE_ERROR};
use serde_json::{json, Value as JsonValue};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::access::peer_ip;
use crate::pipeline::Pipeline;

/// Upper bound on how long `stop` waits for in-flight requests.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum accepted request body (1 MiB). CCU event payloads are tiny;
/// `newDevices` pushes are the largest and stay well below this.
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Lifecycle of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Errors that can occur while starting a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The port could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called on a listener that is not stopped.
    #[error("listener {name} cannot start while {state:?}")]
    InvalidState { name: String, state: ListenerState },

    /// The serving task ended before it reported readiness.
    #[error("listener {0} exited during startup")]
    NotReady(String),
}

/// Per-listener request context.
pub struct ListenerContext {
    /// Listener name used in logs and the health response.
    pub name: String,
    /// Shared event pipeline.
    pub pipeline: Pipeline,
    /// Held while a call is dispatched, so calls on one listener are
    /// processed one at a time in arrival order.
    serial: Mutex<()>,
}

impl ListenerContext {
    pub fn new(name: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            name: name.into(),
            pipeline,
            serial: Mutex::new(()),
        }
    }
}

/// An XML-RPC server bound to one address.
pub struct RpcListener {
    name: String,
    addr: SocketAddr,
    ctx: Arc<ListenerContext>,
    state: ListenerState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RpcListener {
    pub fn new(name: impl Into<String>, addr: SocketAddr, pipeline: Pipeline) -> Self {
        let name = name.into();
        Self {
            ctx: Arc::new(ListenerContext::new(name.clone(), pipeline)),
            name,
            addr,
            state: ListenerState::Stopped,
            local_addr: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// The bound address once running. Differs from the configured address
    /// when port 0 was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the port and starts serving. Returns once the serving task is
    /// running.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Bind` if the port is unavailable, and
    /// `ListenerError::InvalidState` if the listener is not stopped.
    pub async fn start(&mut self) -> Result<(), ListenerError> {
        if self.state != ListenerState::Stopped {
            return Err(ListenerError::InvalidState {
                name: self.name.clone(),
                state: self.state,
            });
        }
        self.state = ListenerState::Starting;

        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.state = ListenerState::Stopped;
                return Err(ListenerError::Bind {
                    addr: self.addr,
                    source,
                });
            }
        };
        let local_addr = listener.local_addr().unwrap_or(self.addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let router = app(self.ctx.clone());
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            let _ = ready_tx.send(());
            let served = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
            if let Err(e) = served {
                tracing::error!(listener = %name, error = %e, "xml-rpc listener failed");
            }
        });

        if ready_rx.await.is_err() {
            self.state = ListenerState::Stopped;
            return Err(ListenerError::NotReady(self.name.clone()));
        }

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        self.state = ListenerState::Running;
        tracing::info!(listener = %self.name, addr = %local_addr, "xml-rpc listener running");
        Ok(())
    }

    /// Stops serving. Safe to call in any state and more than once.
    pub async fn stop(&mut self) {
        if self.state != ListenerState::Running {
            tracing::debug!(listener = %self.name, state = ?self.state, "stop ignored, listener not running");
            return;
        }
        self.state = ListenerState::Stopping;
        tracing::info!(listener = %self.name, "stopping xml-rpc listener");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(listener = %self.name, error = %e, "listener task join error");
                }
                Err(_) => {
                    tracing::warn!(
                        listener = %self.name,
                        timeout_secs = STOP_TIMEOUT.as_secs(),
                        "listener did not drain in time, aborting"
                    );
                    task.abort();
                }
            }
        }

        self.local_addr = None;
        self.state = ListenerState::Stopped;
        tracing::info!(listener = %self.name, "xml-rpc listener stopped");
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Health check handler.
async fn health(Extension(ctx): Extension<Arc<ListenerContext>>) -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "listener": ctx.name,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Decodes and dispatches one XML-RPC call.
///
/// The response is always a well-formed XML-RPC document with status 200.
/// Unparseable bodies and unknown methods are answered with a fault.
async fn rpc_handler(Extension(ctx): Extension<Arc<ListenerContext>>, req: Request<Body>) -> Response {
    let origin = peer_ip(&req);

    let body = match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(listener = %ctx.name, origin = ?origin, error = %e, "unreadable request body");
            return xml_response(encode_fault(&Fault::new(
                FAULT_PARSE_ERROR,
                "unreadable request body",
            )));
        }
    };

    let call = match parse_method_call(&decode_body(&body)) {
        Ok(call) => call,
        Err(e) => {
            tracing::warn!(listener = %ctx.name, origin = ?origin, error = %e, "malformed xml-rpc request");
            return xml_response(encode_fault(&Fault::new(FAULT_PARSE_ERROR, e.to_string())));
        }
    };

    let _serial = ctx.serial.lock().await;
    let document = match ctx.pipeline.dispatch(origin, &call).await {
        Ok(value) => encode_response(&value),
        Err(fault) => {
            tracing::warn!(
                listener = %ctx.name,
                method = %call.method,
                code = fault.code,
                "answering with fault: {}",
                fault.message
            );
            encode_fault(&fault)
        }
    };
    xml_response(document)
}

/// CCU firmwares send UTF-8, older ones ISO-8859-1 without saying so.
fn decode_body(body: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(body) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(body.iter().map(|&b| char::from(b)).collect()),
    }
}

fn xml_response(document: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], document).into_response()
}

/// Builds the listener router.
pub fn app(ctx: Arc<ListenerContext>) -> Router {
    Router::new()
        .route("/", post(rpc_handler))
        .route("/RPC2", post(rpc_handler))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(ctx))
}
