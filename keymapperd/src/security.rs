//! Socket ownership and privilege checks

use keymapper_common::tracing;
use nix::unistd::{chown, getuid, Group};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Group allowed to talk to the daemon
pub const SOCKET_GROUP: &str = "input";

/// Owner and group may read and write
pub const SOCKET_MODE: u32 = 0o660;

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("socket file does not exist: {0}")]
    MissingSocket(PathBuf),
    #[error("failed to set mode of {0}: {1}")]
    Mode(PathBuf, std::io::Error),
    #[error("group '{0}' not found")]
    UnknownGroup(String),
    #[error("failed to change group of {0}: {1}")]
    Chown(PathBuf, nix::Error),
}

pub fn is_root() -> bool {
    getuid().is_root()
}

/// Enforce socket ownership: group "input", mode 0660
///
/// The mode is applied before the group, so a missing group still leaves
/// the socket closed to other users.
pub fn set_socket_permissions<P: AsRef<Path>>(socket_path: P) -> Result<(), SecurityError> {
    let socket_path = socket_path.as_ref();

    if !socket_path.exists() {
        return Err(SecurityError::MissingSocket(socket_path.to_path_buf()));
    }

    info!("Setting socket permissions: group={}, mode={:o}", SOCKET_GROUP, SOCKET_MODE);

    fs::set_permissions(socket_path, fs::Permissions::from_mode(SOCKET_MODE))
        .map_err(|e| SecurityError::Mode(socket_path.to_path_buf(), e))?;

    set_group(socket_path, SOCKET_GROUP)
}

fn set_group(path: &Path, group_name: &str) -> Result<(), SecurityError> {
    let group = Group::from_name(group_name)
        .ok()
        .flatten()
        .ok_or_else(|| SecurityError::UnknownGroup(group_name.to_string()))?;

    chown(path, None, Some(group.gid)).map_err(|e| SecurityError::Chown(path.to_path_buf(), e))?;

    debug!("Set group of {} to {} (gid={})", path.display(), group_name, group.gid);
    Ok(())
}
