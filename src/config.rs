//! Daemon configuration from environment variables

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cache::node_cache::DEFAULT_WRITE_DELAY;
use crate::ipc::SOCKET_NAME;

/// Default interval of the background flush task
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root of node documents and blobs
    pub data_dir: PathBuf,
    /// Unix socket the IPC server listens on
    pub socket_path: PathBuf,
    /// Minimum spacing between durable writes of one node
    pub write_delay: Duration,
    /// How often deferred writes are checked; None disables the task
    pub flush_interval: Option<Duration>,
}

impl DaemonConfig {
    /// Parse configuration from environment variables
    ///
    /// * `NODESTORE_DATA_DIR` - data root (default `./data`)
    /// * `NODESTORE_SOCKET` - socket path (default `<runtime dir>/nodestore.sock`)
    /// * `NODESTORE_WRITE_DELAY_SECS` - debounce window (default 5)
    /// * `NODESTORE_FLUSH_INTERVAL_SECS` - background flush period, 0 disables (default 1)
    pub fn from_env() -> Result<Self> {
        let data_dir = env::var("NODESTORE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        let socket_path = env::var("NODESTORE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_socket_path());

        let write_delay = secs_var("NODESTORE_WRITE_DELAY_SECS")?.unwrap_or(DEFAULT_WRITE_DELAY);

        let flush_interval = match secs_var("NODESTORE_FLUSH_INTERVAL_SECS")? {
            Some(interval) if interval.is_zero() => None,
            Some(interval) => Some(interval),
            None => Some(DEFAULT_FLUSH_INTERVAL),
        };

        Ok(Self {
            data_dir,
            socket_path,
            write_delay,
            flush_interval,
        })
    }
}

fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(SOCKET_NAME)
}

/// Read a whole or fractional number of seconds
fn secs_var(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => parse_secs(&raw)
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}

fn parse_secs(raw: &str) -> Result<Duration> {
    let secs: f64 = raw.trim().parse().context("not a number")?;
    Duration::try_from_secs_f64(secs).context("out of range")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secs() {
        assert_eq!(parse_secs("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_secs(" 0.25 ").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_secs("0").unwrap(), Duration::ZERO);
        assert!(parse_secs("-1").is_err());
        assert!(parse_secs("soon").is_err());
    }

    #[test]
    fn test_default_socket_path_name() {
        assert!(default_socket_path().ends_with(SOCKET_NAME));
    }
}
