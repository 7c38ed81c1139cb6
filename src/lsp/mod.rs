//! LSP session engine
//!
//! Framing and JSON-RPC plumbing (`transport`, `client`), the server process
//! (`process`), the initialize handshake (`handshake`), per-language
//! strategies (`languages`) and the lifecycle manager (`manager`).

pub mod client;
pub mod diagnostics;
pub mod handshake;
pub mod languages;
pub mod manager;
pub mod process;
pub mod transport;

pub use client::{LspClient, ReadinessGate};
pub use handshake::HandshakeController;
pub use languages::{BootstrapStrategy, EmbeddedStrategy, StrategyRegistry};
pub use manager::{LanguageServer, SessionState};
pub use process::ProcessSession;
pub use transport::{FrameError, LspCodec};
