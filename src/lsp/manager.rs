//! Language server session lifecycle
//!
//! `LanguageServer` owns one server process for one workspace and walks it
//! through bootstrap, spawn, handshake, use and teardown:
//!
//! ```text
//! NotStarted -> Bootstrapping -> Spawning -> Handshaking -> Ready -> ShuttingDown -> Stopped
//!      \______________\_____________\____________\__________\-> Failed
//! ```

use crate::bootstrap::{Bootstrapper, HttpArchiveFetcher, LaunchSpec, StreamingCommandRunner};
use crate::config::{platform, ConfigLoader, Settings};
use crate::logging::LogSink;
use crate::lsp::client::LspClient;
use crate::lsp::handshake::{self, HandshakeController};
use crate::lsp::languages::{BootstrapStrategy, StrategyRegistry};
use crate::lsp::process::ProcessSession;
use crate::types::LspError;
use futures::FutureExt;
use lsp_types::*;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    NotStarted,
    Bootstrapping,
    Spawning,
    Handshaking,
    Ready,
    ShuttingDown,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// Still on the way to `Ready`
    pub fn is_starting(self) -> bool {
        matches!(
            self,
            SessionState::NotStarted
                | SessionState::Bootstrapping
                | SessionState::Spawning
                | SessionState::Handshaking
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (NotStarted, Bootstrapping)
            | (Bootstrapping, Spawning)
            | (Spawning, Handshaking)
            | (Handshaking, Ready)
            | (Ready, ShuttingDown)
            | (ShuttingDown, Stopped) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotStarted => "not started",
            SessionState::Bootstrapping => "bootstrapping",
            SessionState::Spawning => "spawning",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::ShuttingDown => "shutting down",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A single language server serving one workspace
pub struct LanguageServer {
    strategy: Arc<dyn BootstrapStrategy>,
    bootstrapper: Bootstrapper,

    /// Canonical workspace root
    root: PathBuf,

    settings: Settings,
    logger: Arc<dyn LogSink>,
    state: watch::Sender<SessionState>,

    /// Set exactly once, just before the session turns `Ready`
    client: OnceLock<Arc<LspClient>>,
    capabilities: OnceLock<Value>,

    process: Mutex<Option<ProcessSession>>,

    /// Documents announced with `didOpen`
    opened: Mutex<HashSet<PathBuf>>,
}

impl LanguageServer {
    /// Server for `language` with the default downloader and command runner
    pub fn create(
        language: &str,
        root: &Path,
        config: &ConfigLoader,
        registry: &StrategyRegistry,
        logger: Arc<dyn LogSink>,
    ) -> Result<Self, LspError> {
        let strategy = registry.get(language)?;
        let install_root = config.cache_dir()?.join(strategy.language());

        let bootstrapper = Bootstrapper::new(
            strategy.profile().clone(),
            install_root,
            Arc::new(HttpArchiveFetcher::new(Arc::clone(&logger))),
            Arc::new(StreamingCommandRunner::new(Arc::clone(&logger))),
            Arc::clone(&logger),
        );

        Self::new(strategy, bootstrapper, root, config.settings().clone(), logger)
    }

    pub fn new(
        strategy: Arc<dyn BootstrapStrategy>,
        bootstrapper: Bootstrapper,
        root: &Path,
        settings: Settings,
        logger: Arc<dyn LogSink>,
    ) -> Result<Self, LspError> {
        let root = root
            .canonicalize()
            .map_err(|_| LspError::InvalidPath(root.to_path_buf()))?;
        let (state, _) = watch::channel(SessionState::NotStarted);

        Ok(Self {
            strategy,
            bootstrapper,
            root,
            settings,
            logger,
            state,
            client: OnceLock::new(),
            capabilities: OnceLock::new(),
            process: Mutex::new(None),
            opened: Mutex::new(HashSet::new()),
        })
    }

    pub fn language(&self) -> &str {
        self.strategy.language()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Capabilities reported by the server's `initialize` response
    pub fn capabilities(&self) -> Option<&Value> {
        self.capabilities.get()
    }

    /// OS process id of the running server
    pub async fn server_pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(ProcessSession::id)
    }

    fn transition(&self, action: &'static str, next: SessionState) -> Result<(), LspError> {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if changed {
            self.logger.debug(&format!(
                "{} session: {} -> {}",
                self.language(),
                previous,
                next
            ));
            Ok(())
        } else {
            Err(LspError::InvalidState {
                action,
                state: previous,
            })
        }
    }

    /// Bootstrap, spawn and initialize the server
    ///
    /// Either the session ends up `Ready` or the originating error is
    /// returned with the session `Failed` and any spawned process killed.
    pub async fn start(&self) -> Result<(), LspError> {
        self.transition("start", SessionState::Bootstrapping)?;
        self.logger.info(&format!(
            "Starting {} language server for {}",
            self.language(),
            self.root.display()
        ));

        match self.launch().await {
            Ok(client) => {
                let _ = self.client.set(client);
                self.transition("finish startup", SessionState::Ready)?;
                self.logger
                    .info(&format!("{} language server is ready", self.language()));
                Ok(())
            }
            Err(e) => {
                self.logger.error(&format!(
                    "Failed to start {} language server: {}",
                    self.language(),
                    e
                ));
                let _ = self.transition("fail", SessionState::Failed);

                if let Some(mut process) = self.process.lock().await.take() {
                    if let Err(kill_error) = process.terminate().await {
                        self.logger.warn(&format!(
                            "Failed to terminate language server: {}",
                            kill_error
                        ));
                    }
                }
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Arc<LspClient>, LspError> {
        self.strategy
            .prepare(&self.root, self.logger.as_ref())
            .await?;

        let launch = self.install().await?;

        self.transition("spawn", SessionState::Spawning)?;
        let mut process = ProcessSession::spawn(&launch, Arc::clone(&self.logger))?;
        let (stdin, stdout) = process.take_stdio()?;
        *self.process.lock().await = Some(process);

        let client = Arc::new(LspClient::connect(
            stdout,
            stdin,
            Arc::clone(&self.logger),
            self.settings.trace_lsp_communication,
        ));
        handshake::register_default_handlers(&client, Arc::clone(&self.logger));

        self.transition("initialize", SessionState::Handshaking)?;
        let controller = HandshakeController::new(
            self.strategy.initialize_params().clone(),
            Arc::clone(&self.logger),
        );
        let capabilities = controller.initialize(&client, &self.root).await?;
        let _ = self.capabilities.set(capabilities);

        Ok(client)
    }

    /// Make sure the server for this platform is installed, without
    /// starting it
    pub async fn install(&self) -> Result<LaunchSpec, LspError> {
        let platform_id = platform::current()?;
        let descriptor = self.strategy.catalog().resolve(platform_id)?;
        self.bootstrapper
            .ensure_installed(descriptor, &self.root)
            .await
    }

    /// Stop the server: `shutdown` (bounded wait), `exit`, then kill
    ///
    /// A server that never started or already stopped is left alone.
    pub async fn shutdown(&self) -> Result<(), LspError> {
        if let Err(e) = self.transition("shut down", SessionState::ShuttingDown) {
            return match self.state() {
                SessionState::NotStarted | SessionState::Stopped | SessionState::Failed => Ok(()),
                _ => Err(e),
            };
        }

        self.logger
            .info(&format!("Shutting down {} language server", self.language()));

        let process = self.process.lock().await.take();
        teardown(
            self.client.get().map(Arc::as_ref),
            process,
            self.settings.shutdown_timeout(),
            self.logger.as_ref(),
        )
        .await;
        self.opened.lock().await.clear();

        self.transition("stop", SessionState::Stopped)
    }

    /// Start the server, run `f`, then shut down whatever `f` did
    ///
    /// Shutdown also runs when `f` fails or panics; the panic is resumed
    /// afterwards.
    pub async fn scoped<F, Fut, T>(self: Arc<Self>, f: F) -> Result<T, LspError>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<T, LspError>>,
    {
        self.start().await?;

        let outcome = AssertUnwindSafe(f(Arc::clone(&self))).catch_unwind().await;

        if let Err(e) = self.shutdown().await {
            self.logger
                .warn(&format!("Error while shutting down language server: {}", e));
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Wait for startup to finish and hand out the client
    async fn ready_client(&self) -> Result<Arc<LspClient>, LspError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| !state.is_starting())
            .await
            .map_err(|_| LspError::ConnectionClosed)?;

        match (state, self.client.get()) {
            (SessionState::Ready, Some(client)) => Ok(Arc::clone(client)),
            (state, _) => Err(LspError::NotReady(state)),
        }
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Send `didOpen` for a document unless it is already open
    async fn ensure_open(&self, client: &LspClient, path: &Path) -> Result<Url, LspError> {
        let path = self.resolve_path(path);
        let uri = Url::from_file_path(&path).map_err(|_| LspError::InvalidPath(path.clone()))?;

        let mut opened = self.opened.lock().await;
        if opened.contains(&path) {
            return Ok(uri);
        }

        let text = tokio::fs::read_to_string(&path).await?;
        client.notify(
            "textDocument/didOpen",
            DidOpenTextDocumentParams {
                text_document: TextDocumentItem {
                    uri: uri.clone(),
                    language_id: self.language().to_string(),
                    version: 0,
                    text,
                },
            },
        )?;
        opened.insert(path);

        Ok(uri)
    }

    /// Open a document (relative to the workspace root)
    pub async fn open_document(&self, path: &Path) -> Result<(), LspError> {
        let client = self.ready_client().await?;
        self.ensure_open(&client, path).await?;
        Ok(())
    }

    /// Close a document; closing one that is not open is a no-op
    pub async fn close_document(&self, path: &Path) -> Result<(), LspError> {
        let client = self.ready_client().await?;
        let path = self.resolve_path(path);

        if !self.opened.lock().await.remove(&path) {
            return Ok(());
        }

        let uri = Url::from_file_path(&path).map_err(|_| LspError::InvalidPath(path.clone()))?;
        client.notify(
            "textDocument/didClose",
            DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri },
            },
        )
    }

    async fn position(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<(Arc<LspClient>, TextDocumentPositionParams), LspError> {
        let client = self.ready_client().await?;
        let uri = self.ensure_open(&client, path).await?;

        Ok((
            client,
            TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position: Position { line, character },
            },
        ))
    }

    /// Go to definition
    pub async fn request_definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<GotoDefinitionResponse>, LspError> {
        let (client, position) = self.position(path, line, character).await?;

        let params = GotoDefinitionParams {
            text_document_position_params: position,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        client.request("textDocument/definition", params).await
    }

    /// Find references
    pub async fn request_references(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        include_declaration: bool,
    ) -> Result<Option<Vec<Location>>, LspError> {
        let (client, position) = self.position(path, line, character).await?;

        let params = ReferenceParams {
            text_document_position: position,
            context: ReferenceContext {
                include_declaration,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        client.request("textDocument/references", params).await
    }

    /// Go to implementation
    pub async fn request_implementation(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<GotoDefinitionResponse>, LspError> {
        let (client, position) = self.position(path, line, character).await?;

        let params = GotoDefinitionParams {
            text_document_position_params: position,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        client.request("textDocument/implementation", params).await
    }

    pub async fn request_completion(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<CompletionResponse>, LspError> {
        let (client, position) = self.position(path, line, character).await?;

        let params = CompletionParams {
            text_document_position: position,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };
        client.request("textDocument/completion", params).await
    }

    /// Raw request pass-through
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        self.ready_client().await?.send_request(method, params).await
    }

    /// Raw notification pass-through
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), LspError> {
        self.ready_client().await?.send_notification(method, params)
    }
}

impl Drop for LanguageServer {
    fn drop(&mut self) {
        // The process is killed on drop; there is no graceful path from here
        self.logger.debug(&format!(
            "LanguageServer for {} dropped in state {}",
            self.strategy.language(),
            *self.state.borrow()
        ));
    }
}

/// Graceful-then-forced stop of a session's server
///
/// Never fails: a `shutdown` request that errors or outlives `timeout` is
/// logged, and the process is killed regardless.
async fn teardown(
    client: Option<&LspClient>,
    process: Option<ProcessSession>,
    timeout: Duration,
    logger: &dyn LogSink,
) {
    if let Some(client) = client {
        match tokio::time::timeout(timeout, client.send_request("shutdown", Value::Null)).await {
            Ok(Ok(_)) => logger.debug("Language server acknowledged shutdown"),
            Ok(Err(e)) => logger.warn(&format!("Shutdown request failed: {}", e)),
            Err(_) => logger.warn(&LspError::ShutdownTimeout(timeout.as_secs()).to_string()),
        }

        if let Err(e) = client.send_notification("exit", Value::Null) {
            logger.debug(&format!("Could not send exit notification: {}", e));
        }
        client.close().await;
    }

    if let Some(mut process) = process {
        if let Err(e) = process.terminate().await {
            logger.warn(&format!("Failed to terminate language server: {}", e));
        }
    }
}
