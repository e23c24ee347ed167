use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TERMINAL_COLS: usize = 80;
pub const DEFAULT_TERMINAL_ROWS: usize = 24;

/// Offline publish buffer budget, measured in line-equivalents.
pub const DEFAULT_BUFFER_LINES: usize = 5_000;

pub const DEFAULT_SESSION_ID: &str = "default";
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Upper bound for a single wire frame on the read side.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Cadence for re-checking the users file for external edits.
pub const USERS_WATCH_INTERVAL: Duration = Duration::from_secs(1);

pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("COVE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    home_dir().join(".cove")
}

pub fn auth_file_path() -> PathBuf {
    data_dir().join("auth.json")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
