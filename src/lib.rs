pub mod api;
pub mod batch;
pub mod dates;
pub mod db;
pub mod engine;
pub mod errors;
pub mod models;
pub mod parser;
pub mod projects;
pub mod resolver;
pub mod tags;
pub mod tasks;
pub mod undo;

pub use crate::api::{dispatch, handle_json, ApiCall, ApiRequest, ApiResponse};
pub use crate::engine::{Clock, Engine, SystemClock};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::Caller;

use std::io::{BufRead, Write};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs a JSON subscriber writing to a daily file under `log_dir`.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "task-engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

/// Answers one JSON request per input line with one JSON envelope per output
/// line. Blank lines are skipped. Returns the number of requests served.
pub fn serve_lines(engine: &Engine, input: impl BufRead, mut output: impl Write) -> AppResult<usize> {
    let mut served = 0usize;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_json(engine, &line);
        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
        served += 1;
    }
    tracing::info!(served, "input closed");
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn serves_one_envelope_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(&dir.path().join("lines.db")).expect("engine");
        let input = concat!(
            r#"{"userId":"alice","request":{"op":"createTask","title":"First"}}"#,
            "\n\n",
            r#"{"userId":"alice","request":{"op":"listTasks"}}"#,
            "\n",
            "not json\n"
        );
        let mut output = Vec::new();
        let served = serve_lines(&engine, input.as_bytes(), &mut output).expect("serve");
        assert_eq!(served, 3);

        let text = String::from_utf8(output).expect("utf8");
        let envelopes: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[0]["status"], 201);
        assert_eq!(envelopes[1]["data"].as_array().map(Vec::len), Some(1));
        assert_eq!(envelopes[2]["error"]["code"], "VALIDATION_ERROR");
    }
}
