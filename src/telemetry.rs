use crate::config::BridgeConfig;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Where the JSON trace goes: `PTYBRIDGE_TRACE_LOG`, else the `--log` directory.
pub(crate) fn tracing_log_path(config: &BridgeConfig) -> Option<PathBuf> {
    if let Some(path) = env::var_os("PTYBRIDGE_TRACE_LOG").filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(path));
    }
    config
        .log_dir
        .as_ref()
        .map(|dir| dir.join(format!("ptybridge-{}.trace.jsonl", std::process::id())))
}

/// Install the global JSON subscriber once. Without a log path tracing stays off.
pub fn init_tracing(config: &BridgeConfig) {
    let Some(path) = tracing_log_path(config) else {
        return;
    };
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let _ = TRACING_INIT.get_or_init(|| {
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(_) => return,
        };
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_max_level(level)
            .with_writer(file)
            .with_current_span(false)
            .with_span_list(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
