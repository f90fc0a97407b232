use anyhow::{anyhow, Context};
use std::path::PathBuf;
use task_engine::{init_tracing, serve_lines, Engine};

const DB_ENV: &str = "TASK_ENGINE_DB";
const DEFAULT_DB: &str = "task-engine.sqlite";

fn main() -> anyhow::Result<()> {
    let db_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(DB_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
    let log_dir = db_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(|parent| parent.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));

    init_tracing(&log_dir).map_err(|error| anyhow!("failed to initialise logging: {error}"))?;
    let engine = Engine::new(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve_lines(&engine, stdin.lock(), stdout.lock()).context("request loop failed")?;
    Ok(())
}
