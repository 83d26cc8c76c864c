//! Runtime settings resolved from the command line and environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::browser::REOPEN_SECS;
use crate::ports::PORT_LOCK_SECS;

pub const DEFAULT_PORT: u16 = 8000;

const PORT_LOCK_FILE: &str = ".web_server_controller_state.json";
const BROWSER_STATE_FILE: &str = ".web_browser_controller_state.json";

/// Values the ports and browser components are built from.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub state_dir: PathBuf,
    pub lock_duration: Duration,
    pub reopen_after: Duration,
}

impl Settings {
    pub fn new(port: u16, state_dir: PathBuf) -> Self {
        Self {
            port,
            state_dir,
            lock_duration: Duration::from_secs(PORT_LOCK_SECS),
            reopen_after: Duration::from_secs(REOPEN_SECS),
        }
    }

    pub fn port_lock_file(&self) -> PathBuf {
        self.state_dir.join(PORT_LOCK_FILE)
    }

    pub fn browser_state_file(&self) -> PathBuf {
        self.state_dir.join(BROWSER_STATE_FILE)
    }
}

/// `~/.mcp/vegaview`, or a directory under the system temp dir when no home
/// directory can be determined.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mcp")
        .join(env!("CARGO_PKG_NAME"))
}

/// Truthy values accepted for boolean environment switches.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
