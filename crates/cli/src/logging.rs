use std::fs::{self, OpenOptions};
use std::sync::Mutex;

use hcp_core::error::{HcpError, Result};
use hcp_core::state::expand_path;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_PATH: &str = "~/.hcp/hcp.log";

/// Sends all tracing output to `~/.hcp/hcp.log` so it never fights with the
/// spinner. `RUST_LOG` overrides the configured level.
pub fn init(level: &str) -> Result<()> {
    let path = expand_path(LOG_PATH)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| HcpError::Config(format!("Failed to create {}: {}", dir.display(), e)))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| HcpError::Config(format!("Failed to open {}: {}", path.display(), e)))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .map_err(|e| HcpError::Config(format!("Failed to init logging: {}", e)))
}
