//! lspboot - language server bootstrapper and session engine
//!
//! Installs a third-party language server on demand (download, extract,
//! package install, build) and drives it over JSON-RPC: spawn, initialize
//! handshake, requests and notifications, and bounded graceful shutdown.
//! Everything language-specific is data embedded from `registry/`.

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod lsp;
pub mod types;

pub use bootstrap::{Bootstrapper, LaunchSpec};
pub use config::ConfigLoader;
pub use logging::{LogSink, MemorySink, TracingSink};
pub use lsp::{LanguageServer, LspClient, SessionState, StrategyRegistry};
pub use types::LspError;
