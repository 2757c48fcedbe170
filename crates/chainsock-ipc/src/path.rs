//! Node IPC path discovery.

use std::path::{Path, PathBuf};

/// File name geth uses for its IPC endpoint.
pub const GETH_IPC_FILE: &str = "geth.ipc";

/// Where a locally running geth listens by default.
///
/// `None` when the home directory cannot be determined.
pub fn default_ipc_path() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        Some(PathBuf::from(format!(r"\\.\pipe\{GETH_IPC_FILE}")))
    }
    #[cfg(target_os = "macos")]
    {
        home_dir().map(|home| home.join("Library").join("Ethereum").join(GETH_IPC_FILE))
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        home_dir().map(|home| home.join(".ethereum").join(GETH_IPC_FILE))
    }
}

/// Expand a leading `~` and make the path absolute. The file need not exist.
pub fn resolve_ipc_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => match home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    };
    if expanded.is_absolute() {
        return expanded;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(expanded),
        Err(_) => expanded,
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    let var = "USERPROFILE";
    #[cfg(not(windows))]
    let var = "HOME";
    std::env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from)
}
