use std::path::{Path, PathBuf};

pub use stencil_core::config::stencil_root;

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    stencil_root(home).join(DAEMON_SOCKET)
}
