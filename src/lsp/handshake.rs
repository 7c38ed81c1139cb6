//! Initialize handshake and built-in message handlers

use crate::config::InitializeParamsTemplate;
use crate::logging::LogSink;
use crate::lsp::client::LspClient;
use crate::lsp::diagnostics;
use crate::types::LspError;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

/// Runs `initialize` / `initialized` against a connected client
pub struct HandshakeController {
    template: InitializeParamsTemplate,
    logger: Arc<dyn LogSink>,
}

impl HandshakeController {
    pub fn new(template: InitializeParamsTemplate, logger: Arc<dyn LogSink>) -> Self {
        Self { template, logger }
    }

    /// Perform the handshake for the workspace at `root` and return the
    /// server's capabilities
    ///
    /// Opens the client's readiness gate on success. A second handshake on
    /// the same client is a protocol violation.
    pub async fn initialize(&self, client: &LspClient, root: &Path) -> Result<Value, LspError> {
        if client.readiness().is_open() {
            return Err(LspError::ProtocolViolation(
                "initialize already completed for this session".to_string(),
            ));
        }

        let params = self.template.render(root)?;

        self.logger.info(
            "Sending initialize request from LSP client to LSP server and awaiting response",
        );
        let response = client.send_request("initialize", params).await?;

        let capabilities = response.get("capabilities").cloned().ok_or_else(|| {
            LspError::ProtocolViolation("initialize response has no capabilities".to_string())
        })?;

        let names: Vec<&str> = capabilities
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default();
        self.logger
            .info(&format!("Language server capabilities: {:?}", names));

        client.send_notification("initialized", json!({}))?;

        if !client.readiness().open() {
            return Err(LspError::ProtocolViolation(
                "initialize completed twice for this session".to_string(),
            ));
        }

        Ok(capabilities)
    }
}

/// Install the notification and server-request handlers every session needs
pub fn register_default_handlers(client: &LspClient, logger: Arc<dyn LogSink>) {
    let log = Arc::clone(&logger);
    client.on_notification("window/logMessage", move |params| {
        diagnostics::log_window_message(log.as_ref(), &params)
    });

    client.on_notification("$/progress", |_| {});

    let log = Arc::clone(&logger);
    client.on_notification("textDocument/publishDiagnostics", move |params| {
        diagnostics::log_diagnostics(log.as_ref(), &params)
    });

    for method in [
        "client/registerCapability",
        "client/unregisterCapability",
        "window/workDoneProgress/create",
    ] {
        client.on_request(method, |_| Ok(Value::Null));
    }

    client.on_request("workspace/configuration", |params| {
        let items = params
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        Ok(Value::Array(vec![Value::Null; items]))
    });
}
