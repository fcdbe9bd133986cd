//! Named request/reply service over UNIX domain sockets
//!
//! A server registered as `name` under `root` listens on
//! `root/comm/<name>.sock` and logs to `root/logs/upc_<name>.log`.
//!
//! # Wire format
//!
//! A byte stream of messages, each terminated by a single NUL byte. There is
//! no length prefix. A connection may carry any number of requests; replies
//! come back one per request, in order.

pub mod client;
pub mod framing;
pub mod handler;
pub mod log;
pub mod server;

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Longest accepted server name
pub const MAX_NAME_LEN: usize = 15;

/// Socket directory under the root
pub const COMM_DIR: &str = "comm";
/// Log directory under the root
pub const LOGS_DIR: &str = "logs";

const SOCKET_EXT: &str = ".sock";
const LOG_PREFIX: &str = "upc_";
const LOG_EXT: &str = ".log";

/// Size of `sockaddr_un.sun_path`, including the trailing NUL
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SUN_PATH_MAX: usize = 108;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const SUN_PATH_MAX: usize = 104;

/// Root used when the application has no configured one: `$HOME/rover`.
pub fn default_root() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join("rover"))
}

/// Check a server name: 1..=15 bytes of `[A-Za-z0-9_.-]`, not starting with `.`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("server name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "server name too long: max {MAX_NAME_LEN} chars, got {}",
            name.len()
        )));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidArgument(format!(
            "server name '{name}' starts with '.'"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(Error::InvalidArgument(format!(
            "server name '{name}' contains {c:?}"
        )));
    }
    Ok(())
}

/// Resolve `root/comm/<name>.sock`, checking the name and that the path fits
/// in a socket address.
pub fn socket_path(root: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    let path = root.join(COMM_DIR).join(format!("{name}{SOCKET_EXT}"));
    let len = path.as_os_str().len();
    if len >= SUN_PATH_MAX {
        return Err(Error::InvalidArgument(format!(
            "socket path {} is {len} bytes, limit is {}",
            path.display(),
            SUN_PATH_MAX - 1
        )));
    }
    Ok(path)
}

pub(crate) fn log_file_name(name: &str) -> String {
    format!("{LOG_PREFIX}{name}{LOG_EXT}")
}
