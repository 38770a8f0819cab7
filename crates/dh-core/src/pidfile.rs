//! PID file utilities for single-instance management
//!
//! The agent records its own PID at startup so a second agent refuses to
//! run next to a live one, and removes the file on every exit path.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// Read the PID from the PID file
///
/// Returns `Ok(Some(pid))` if the file exists and contains a valid PID,
/// `Ok(None)` if the file doesn't exist, or an error if the file is malformed.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let pid = contents
                .trim()
                .parse::<u32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a PID to the PID file
///
/// Creates parent directories if they don't exist.
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}

/// Remove the PID file
///
/// Returns `Ok(())` even if the file doesn't exist.
pub fn remove_pid_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check if a process with the given PID is still alive
///
/// Uses kill(pid, 0): success or EPERM both mean the process exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Claim the PID file for the current process
///
/// Fails with `AlreadyExists` when the file names another live process. A
/// stale file left behind by a crashed agent is overwritten.
#[cfg(unix)]
pub fn claim_pid_file(path: &Path) -> io::Result<()> {
    let own = std::process::id();
    match read_pid_file(path) {
        Ok(Some(pid)) if pid != own && is_process_alive(pid) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("another agent is running with PID {}", pid),
            ));
        }
        Ok(Some(pid)) => tracing::debug!("Replacing stale PID file for PID {}", pid),
        Ok(None) => {}
        Err(e) => tracing::warn!("Ignoring unreadable PID file {:?}: {}", path, e),
    }
    write_pid_file(path, own)
}
