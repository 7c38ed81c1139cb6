//! LSP client implementation
//!
//! Handles JSON-RPC traffic with a single language server over any pair of
//! async byte streams (normally the server's stdout/stdin).
//!
//! Three background tasks do the work:
//! - a writer task, the only thing that ever writes to the server
//! - a reader task, which turns the byte stream into frames
//! - a dispatch task, which resolves pending requests, runs notification
//!   handlers and answers server-initiated requests
//!
//! Request ids are issued and their waiters registered under one lock, so a
//! response can never arrive for an id that is not yet known.

use crate::logging::LogSink;
use crate::lsp::transport::{FrameError, LspCodec};
use crate::types::LspError;
use futures::{SinkExt, StreamExt};
use lsp_server::{ErrorCode, Message, Notification, Request, RequestId, Response, ResponseError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Callback for server notifications, run on the dispatch task
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback answering a server-initiated request
pub type RequestHandler = Arc<dyn Fn(Value) -> Result<Value, ResponseError> + Send + Sync>;

type Waiter = oneshot::Sender<Result<Value, LspError>>;

/// How long `close` waits for queued messages to reach the server
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
enum Closed {
    Decode(String),
    Eof,
}

impl Closed {
    fn error(&self) -> LspError {
        match self {
            Closed::Decode(reason) => LspError::TransportDecode(reason.clone()),
            Closed::Eof => LspError::ConnectionClosed,
        }
    }
}

struct Pending {
    next_id: i32,
    waiters: HashMap<RequestId, Waiter>,

    /// Set once the inbound stream has ended; later requests fail fast
    closed: Option<Closed>,
}

#[derive(Default)]
struct Handlers {
    notifications: HashMap<String, NotificationHandler>,
    requests: HashMap<String, RequestHandler>,
}

/// One-shot gate opened after the initialize handshake
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the gate; returns `false` if it was already open
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate opens
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// JSON-RPC client for a single language server
pub struct LspClient {
    pending: Arc<Mutex<Pending>>,
    handlers: Arc<RwLock<Handlers>>,

    /// Queue feeding the writer task; taken on close
    outgoing: std::sync::Mutex<Option<mpsc::UnboundedSender<Message>>>,

    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
    background: Vec<JoinHandle<()>>,
    readiness: ReadinessGate,
    logger: Arc<dyn LogSink>,
}

impl LspClient {
    /// Start the client over `reader` (server output) and `writer` (server input)
    ///
    /// With `trace` set, every message in both directions is logged verbatim.
    pub fn connect<R, W>(reader: R, writer: W, logger: Arc<dyn LogSink>, trace: bool) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let pending = Arc::new(Mutex::new(Pending {
            next_id: 1,
            waiters: HashMap::new(),
            closed: None,
        }));
        let handlers = Arc::new(RwLock::new(Handlers::default()));

        let writer_task = tokio::spawn(Self::write_loop(
            FramedWrite::new(writer, LspCodec::default()),
            outgoing_rx,
            Arc::clone(&logger),
            trace,
        ));
        let reader_task = tokio::spawn(Self::read_loop(
            FramedRead::new(reader, LspCodec::default()),
            frame_tx,
        ));
        let dispatch_task = tokio::spawn(Self::dispatch_loop(
            frame_rx,
            Arc::clone(&pending),
            Arc::clone(&handlers),
            outgoing_tx.downgrade(),
            Arc::clone(&logger),
            trace,
        ));

        Self {
            pending,
            handlers,
            outgoing: std::sync::Mutex::new(Some(outgoing_tx)),
            writer: std::sync::Mutex::new(Some(writer_task)),
            background: vec![reader_task, dispatch_task],
            readiness: ReadinessGate::new(),
            logger,
        }
    }

    /// Background task writing queued messages to the server
    async fn write_loop<W>(
        mut sink: FramedWrite<W, LspCodec>,
        mut outgoing: mpsc::UnboundedReceiver<Message>,
        logger: Arc<dyn LogSink>,
        trace: bool,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(message) = outgoing.recv().await {
            if trace {
                match serde_json::to_string(&message) {
                    Ok(text) => logger.debug(&format!("LSP: client -> server: {}", text)),
                    Err(e) => logger.debug(&format!("LSP: client -> server: <{}>", e)),
                }
            }

            if let Err(e) = sink.send(message).await {
                logger.error(&format!("Failed to write message: {}", e));
                break;
            }
        }

        if let Err(e) = SinkExt::<Message>::close(&mut sink).await {
            logger.debug(&format!("Failed to close server input: {}", e));
        }
    }

    /// Background task splitting the server output into frames
    async fn read_loop<R>(
        mut stream: FramedRead<R, LspCodec>,
        frames: mpsc::UnboundedSender<Result<Value, FrameError>>,
    ) where
        R: AsyncRead + Unpin,
    {
        while let Some(frame) = stream.next().await {
            let failed = frame.is_err();
            if frames.send(frame).is_err() || failed {
                break;
            }
        }
    }

    async fn dispatch_loop(
        mut frames: mpsc::UnboundedReceiver<Result<Value, FrameError>>,
        pending: Arc<Mutex<Pending>>,
        handlers: Arc<RwLock<Handlers>>,
        outgoing: mpsc::WeakUnboundedSender<Message>,
        logger: Arc<dyn LogSink>,
        trace: bool,
    ) {
        while let Some(frame) = frames.recv().await {
            match frame {
                Ok(value) => {
                    if trace {
                        logger.debug(&format!("LSP: server -> client: {}", value));
                    }
                    Self::handle_message(value, &pending, &handlers, &outgoing, logger.as_ref())
                        .await;
                }
                Err(e) => {
                    logger.error(&format!("Failed to decode server message: {}", e));
                    Self::close_pending(&pending, Closed::Decode(e.to_string())).await;
                    return;
                }
            }
        }

        logger.debug("Language server closed its output stream");
        Self::close_pending(&pending, Closed::Eof).await;
    }

    async fn handle_message(
        value: Value,
        pending: &Mutex<Pending>,
        handlers: &RwLock<Handlers>,
        outgoing: &mpsc::WeakUnboundedSender<Message>,
        logger: &dyn LogSink,
    ) {
        let message: Message = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                logger.warn(&format!("Ignoring unrecognized message from server: {}", e));
                return;
            }
        };

        match message {
            Message::Response(response) => {
                let waiter = pending.lock().await.waiters.remove(&response.id);
                let Some(waiter) = waiter else {
                    logger.debug(&format!("Dropping response for unknown id {}", response.id));
                    return;
                };

                let outcome = match response.error {
                    Some(error) => Err(LspError::ResponseError {
                        code: error.code,
                        message: error.message,
                    }),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = waiter.send(outcome);
            }
            Message::Notification(notification) => {
                let handler = handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .notifications
                    .get(&notification.method)
                    .cloned();

                match handler {
                    Some(handler) => handler(notification.params),
                    None => logger.debug(&format!(
                        "No handler for notification {}",
                        notification.method
                    )),
                }
            }
            Message::Request(request) => {
                let handler = handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .requests
                    .get(&request.method)
                    .cloned();

                let response = match handler {
                    Some(handler) => match handler(request.params) {
                        Ok(result) => Response::new_ok(request.id, result),
                        Err(error) => Response {
                            id: request.id,
                            result: None,
                            error: Some(error),
                        },
                    },
                    None => {
                        logger.debug(&format!("Unhandled server request {}", request.method));
                        Response::new_err(
                            request.id,
                            ErrorCode::MethodNotFound as i32,
                            format!("Unhandled method {}", request.method),
                        )
                    }
                };

                if let Some(tx) = outgoing.upgrade() {
                    let _ = tx.send(Message::Response(response));
                }
            }
        }
    }

    /// Reject every outstanding request and refuse new ones
    async fn close_pending(pending: &Mutex<Pending>, closed: Closed) {
        let mut pending = pending.lock().await;
        for (_, waiter) in pending.waiters.drain() {
            let _ = waiter.send(Err(closed.error()));
        }
        pending.closed = Some(closed);
    }

    fn enqueue(&self, message: Message) -> Result<(), LspError> {
        let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        match outgoing.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| LspError::ConnectionClosed),
            None => Err(LspError::ConnectionClosed),
        }
    }

    /// Send a request and wait for the matching response
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            if let Some(closed) = &pending.closed {
                return Err(closed.error());
            }

            let id = RequestId::from(pending.next_id);
            pending.next_id += 1;
            pending.waiters.insert(id.clone(), tx);

            let request = Request {
                id: id.clone(),
                method: method.to_string(),
                params,
            };
            if let Err(e) = self.enqueue(Message::Request(request)) {
                pending.waiters.remove(&id);
                return Err(e);
            }
        }

        rx.await.map_err(|_| LspError::ConnectionClosed)?
    }

    /// Typed wrapper over [`send_request`](Self::send_request)
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R, LspError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let result = self
            .send_request(method, serde_json::to_value(params)?)
            .await?;

        serde_json::from_value(result).map_err(|e| {
            LspError::ProtocolViolation(format!("Unexpected {} response: {}", method, e))
        })
    }

    /// Fire-and-forget notification
    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), LspError> {
        self.enqueue(Message::Notification(Notification {
            method: method.to_string(),
            params,
        }))
    }

    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), LspError> {
        self.send_notification(method, serde_json::to_value(params)?)
    }

    /// Register (or replace) the handler for a notification method
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .notifications
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Register (or replace) the handler for a server-initiated request
    pub fn on_request<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .requests
            .insert(method.to_string(), Arc::new(handler));
    }

    pub fn readiness(&self) -> &ReadinessGate {
        &self.readiness
    }

    /// Stop accepting outgoing messages and flush what is queued
    ///
    /// The server's input stream is shut down once the queue drains.
    pub async fn close(&self) {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer {
            if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
                self.logger
                    .debug("Timed out flushing messages to the language server");
            }
        }
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        if let Some(writer) = self
            .writer
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            writer.abort();
        }
        for task in &self.background {
            task.abort();
        }
    }
}
