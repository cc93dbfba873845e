#![allow(unsafe_code)]
//! Daemonization, the pidfile, and the privilege drop the config's `user`
//! clause and the `-u` flag both ask for. Named collaborators rather than
//! part of the core loop: the dispatcher and process manager never call
//! into this module, only `main` does, once, at startup.

use nix::unistd::{self, ForkResult, Gid, Uid};
use std::io;
use std::path::Path;

/// Forks, detaches from the controlling terminal, and re-homes std streams
/// to `/dev/null` in the child. The parent exits immediately with status 0
/// once it sees the child has started. The original daemon calls libc's
/// single-fork `daemon(0, 0)`; this does a second fork after `setsid()` so
/// the daemon can never reacquire a controlling terminal, with no pipe
/// handshake to report early startup failures back to the parent either
/// way.
pub fn daemonize() -> io::Result<()> {
    match unsafe { unistd::fork() }.map_err(nix_to_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    unistd::setsid().map_err(nix_to_io)?;

    match unsafe { unistd::fork() }.map_err(nix_to_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_standard_streams()?;
    Ok(())
}

fn redirect_standard_streams() -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let dev_null = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = dev_null.as_raw_fd();
    for target in [0, 1, 2] {
        nix::unistd::dup2(fd, target).map_err(nix_to_io)?;
    }
    Ok(())
}

/// Writes the current pid to `path` as a decimal number followed by a
/// newline, truncating whatever was there. No locking, matching the
/// pidfile format the daemon has always used.
pub fn write_pidfile(path: &Path) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Removes the pidfile on clean shutdown. A missing file is not an error:
/// the daemon may be asked to exit before it ever got around to writing
/// one.
pub fn remove_pidfile(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) | Err(_) => {}
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("failed to look up user {0:?}: {1}")]
    Lookup(String, #[source] nix::errno::Errno),
    #[error("failed to drop privileges: {0}")]
    Drop(#[source] nix::errno::Errno),
}

/// Resolves `username` and permanently drops to its uid/gid, applying
/// supplementary groups first, then the primary gid, then the uid — the
/// order that keeps every step from failing on insufficient privilege
/// before the uid change. A no-op when the process isn't running as root
/// to begin with, since giving up privileges it doesn't have would just
/// fail loudly for no benefit.
pub fn drop_privileges(username: &str) -> Result<(), PrivilegeError> {
    if !unistd::Uid::effective().is_root() {
        return Ok(());
    }

    let user = unistd::User::from_name(username)
        .map_err(|e| PrivilegeError::Lookup(username.to_string(), e))?
        .ok_or_else(|| PrivilegeError::UnknownUser(username.to_string()))?;

    unistd::initgroups(&std::ffi::CString::new(username).unwrap_or_default(), user.gid)
        .map_err(PrivilegeError::Drop)?;
    unistd::setgid(user.gid).map_err(PrivilegeError::Drop)?;
    unistd::setuid(user.uid).map_err(PrivilegeError::Drop)?;
    Ok(())
}

/// Resolves `username` into the `uid`/`gids` pair a `Handler`'s
/// `Credentials` needs, without changing the calling process's own
/// identity. Used by the configuration loader to resolve each rule's
/// `user` clause.
pub fn resolve_credentials(username: &str) -> Result<(u32, Vec<u32>), PrivilegeError> {
    let user = unistd::User::from_name(username)
        .map_err(|e| PrivilegeError::Lookup(username.to_string(), e))?
        .ok_or_else(|| PrivilegeError::UnknownUser(username.to_string()))?;

    let groups = unistd::getgrouplist(
        &std::ffi::CString::new(username).unwrap_or_default(),
        user.gid,
    )
    .unwrap_or_else(|_| vec![user.gid]);

    let mut gids: Vec<u32> = groups.into_iter().map(Gid::as_raw).collect();
    // `setgid` is called with `gids[0]`; put the primary group first
    // regardless of where the supplementary-group lookup placed it.
    if let Some(pos) = gids.iter().position(|&g| g == user.gid.as_raw()) {
        gids.swap(0, pos);
    } else {
        gids.insert(0, user.gid.as_raw());
    }

    Ok((user.uid.as_raw(), gids))
}

fn nix_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_remove_pidfile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("direvent.pid");

        write_pidfile(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{}\n", std::process::id()));

        remove_pidfile(&path);
        assert!(!path.exists());
    }

    #[test]
    fn removing_a_missing_pidfile_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        remove_pidfile(&dir.path().join("does-not-exist.pid"));
    }

    #[test]
    fn drop_privileges_is_a_noop_when_not_root() {
        // The test suite never runs as root, so this exercises the
        // early-return path rather than a real uid change.
        assert!(drop_privileges("nobody").is_ok());
    }

    #[test]
    fn resolve_credentials_rejects_unknown_user() {
        let err = resolve_credentials("no-such-user-xyz-direvent-test").unwrap_err();
        assert!(matches!(err, PrivilegeError::UnknownUser(_)));
    }
}
