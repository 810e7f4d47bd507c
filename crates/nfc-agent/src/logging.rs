//! Tracing subscriber setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AgentConfig;

const DEFAULT_LOG_FILE: &str = "nfc-agent.log";

/// Level directive applied to the workspace crates only.
pub fn directive(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    format!("nfc_agent={level},nfc_core={level},nfc_hal={level}")
}

/// Install the global subscriber. Console output goes to stderr so command
/// output on stdout stays machine-readable. The returned guard flushes the
/// log file and must be held until exit.
pub fn init(config: &AgentConfig) -> Result<Option<WorkerGuard>, TryInitError> {
    let filter = EnvFilter::try_new(directive(&config.log_level)).unwrap_or_else(|_| EnvFilter::new("warn"));

    let (json, plain) = if config.log_json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(std::io::stderr)))
    };

    let (file, guard) = match &config.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let name = path.file_name().map_or_else(|| DEFAULT_LOG_FILE.into(), |n| n.to_os_string());
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .with(file)
        .try_init()?;
    Ok(guard)
}
