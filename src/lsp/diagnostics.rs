//! Logging of server-pushed diagnostics and window messages

use crate::logging::LogSink;
use serde::Deserialize;
use serde_json::Value;
use tracing::Level;

/// Only this many diagnostics per file are written to the log
const MAX_LOGGED: usize = 5;

#[derive(Debug, Deserialize)]
struct PublishedDiagnostics {
    #[serde(default)]
    uri: String,
    #[serde(default)]
    diagnostics: Vec<DiagnosticRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DiagnosticRecord {
    range: RangeRecord,
    severity: Option<i64>,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RangeRecord {
    start: PositionRecord,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PositionRecord {
    line: u64,
}

/// LSP severity (1 = Error .. 4 = Hint); missing or out-of-range values
/// are clamped
pub fn severity_name(severity: Option<i64>) -> &'static str {
    match severity.unwrap_or(1).clamp(1, 4) {
        1 => "Error",
        2 => "Warning",
        3 => "Info",
        _ => "Hint",
    }
}

/// Handle a `textDocument/publishDiagnostics` notification
pub fn log_diagnostics(logger: &dyn LogSink, params: &Value) {
    let published: PublishedDiagnostics = match serde_json::from_value(params.clone()) {
        Ok(published) => published,
        Err(e) => {
            logger.debug(&format!("Ignoring malformed diagnostics: {}", e));
            return;
        }
    };

    if published.diagnostics.is_empty() {
        return;
    }

    logger.info(&format!(
        "Diagnostics for {}: {} issues found",
        published.uri,
        published.diagnostics.len()
    ));
    for diagnostic in published.diagnostics.iter().take(MAX_LOGGED) {
        logger.info(&format!(
            "  Line {}: {} - {}",
            diagnostic.range.start.line,
            severity_name(diagnostic.severity),
            diagnostic.message
        ));
    }
}

/// Handle a `window/logMessage` notification
pub fn log_window_message(logger: &dyn LogSink, params: &Value) {
    let message = params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let level = match params.get("type").and_then(Value::as_i64) {
        Some(1) => Level::ERROR,
        Some(2) => Level::WARN,
        Some(3) => Level::INFO,
        _ => Level::DEBUG,
    };
    logger.log(level, &format!("LSP: window/logMessage: {}", message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use serde_json::json;

    fn diagnostic(line: u64, severity: i64, message: &str) -> Value {
        json!({
            "range": {
                "start": { "line": line, "character": 0 },
                "end": { "line": line, "character": 4 }
            },
            "severity": severity,
            "message": message
        })
    }

    #[test]
    fn test_severity_names() {
        assert_eq!(severity_name(Some(1)), "Error");
        assert_eq!(severity_name(Some(2)), "Warning");
        assert_eq!(severity_name(Some(3)), "Info");
        assert_eq!(severity_name(Some(4)), "Hint");
        assert_eq!(severity_name(Some(9)), "Hint");
        assert_eq!(severity_name(Some(0)), "Error");
        assert_eq!(severity_name(None), "Error");
    }

    #[test]
    fn test_logs_count_and_first_five() {
        let sink = MemorySink::new();
        let diagnostics: Vec<Value> = (0..7)
            .map(|i| diagnostic(i, 2, &format!("issue {}", i)))
            .collect();

        log_diagnostics(
            &sink,
            &json!({ "uri": "file:///ws/a.sol", "diagnostics": diagnostics }),
        );

        let messages = sink.messages();
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0], "Diagnostics for file:///ws/a.sol: 7 issues found");
        assert_eq!(messages[1], "  Line 0: Warning - issue 0");
        assert_eq!(messages[5], "  Line 4: Warning - issue 4");
    }

    #[test]
    fn test_empty_diagnostics_are_silent() {
        let sink = MemorySink::new();
        log_diagnostics(&sink, &json!({ "uri": "file:///ws/a.sol", "diagnostics": [] }));
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_window_message_levels() {
        let sink = MemorySink::new();
        log_window_message(&sink, &json!({ "type": 1, "message": "crashed" }));
        log_window_message(&sink, &json!({ "type": 3, "message": "indexing" }));
        log_window_message(&sink, &json!({ "type": 4, "message": "details" }));

        assert!(sink.contains(Level::ERROR, "crashed"));
        assert!(sink.contains(Level::INFO, "indexing"));
        assert!(sink.contains(Level::DEBUG, "details"));
    }
}
