//! logging utilities

use std::str::FromStr;

use tracing::Level;

/// Environment variable selecting the log level when the library is driven through the C ABI.
pub const LOG_ENV: &str = "MTMD_SESSION_LOG";

// 初始化日志
pub fn init_logger(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_ansi(true)
        .with_max_level(level)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .try_init();
}

/// Installs the subscriber only when [`LOG_ENV`] names a level (`error` .. `trace`).
///
/// Returns the level in use, C callers get no output by default.
pub fn init_logger_from_env() -> Option<Level> {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| Level::from_str(v.trim()).ok())?;
    init_logger(level);
    Some(level)
}
