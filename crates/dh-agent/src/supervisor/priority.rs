//! Scheduling priority of the agent and the daemon's descendants
//!
//! The agent raises its own priority so it stays responsive under load.
//! Workloads launched by the daemon inherit that priority, so a background
//! scan resets any descendant that still runs with a negative nice value.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tokio::task::JoinHandle;

use crate::state::DaemonHandle;

/// Nice value the agent runs at
pub const AGENT_PRIORITY: i32 = -10;

/// Every transitive child of `root` in a PID to parent-PID table
///
/// `root` itself is never part of the result.
pub fn descendants_of(root: u32, parents: &HashMap<u32, u32>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&pid, &parent) in parents {
        if pid != parent {
            children.entry(parent).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut pending = vec![root];
    while let Some(pid) = pending.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    pending.push(kid);
                }
            }
        }
    }
    found
}

fn process_table() -> HashMap<u32, u32> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    system
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            process
                .parent()
                .map(|parent| (pid.as_u32(), parent.as_u32()))
        })
        .collect()
}

#[cfg(target_os = "linux")]
unsafe fn clear_errno() {
    *libc::__errno_location() = 0;
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn clear_errno() {
    *libc::__error() = 0;
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
unsafe fn clear_errno() {}

fn get_priority(pid: u32) -> io::Result<i32> {
    // -1 is a valid nice value, so errno is the only error signal
    unsafe {
        clear_errno();
        let value = libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t);
        match io::Error::last_os_error().raw_os_error() {
            Some(0) | None => Ok(value),
            Some(_) => Err(io::Error::last_os_error()),
        }
    }
}

fn set_priority(pid: u32, priority: i32) -> io::Result<()> {
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, priority) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Set the nice value of the calling process
pub fn set_own_priority(priority: i32) -> io::Result<()> {
    set_priority(0, priority)
}

/// Reset `pid` to nice 0 if it runs with a negative nice value
///
/// Returns whether the priority was changed.
fn demote(pid: u32) -> io::Result<bool> {
    if get_priority(pid)? < 0 {
        set_priority(pid, 0)?;
        return Ok(true);
    }
    Ok(false)
}

/// Periodically demote every descendant of the current daemon
pub fn spawn_priority_guard(handle: DaemonHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(daemon) = handle.get() else {
                continue;
            };

            let table = match tokio::task::spawn_blocking(process_table).await {
                Ok(table) => table,
                Err(e) => {
                    tracing::debug!("Process scan failed: {}", e);
                    continue;
                }
            };

            for pid in descendants_of(daemon.pid, &table) {
                match demote(pid) {
                    Ok(true) => tracing::debug!("Reset priority of PID {} to 0", pid),
                    Ok(false) => {}
                    // The process may have exited since the scan
                    Err(e) => tracing::trace!("Cannot adjust priority of PID {}: {}", pid, e),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descendants_follow_parent_chain() {
        // 10 -> 11 -> 12, 10 -> 13, 20 unrelated
        let parents = HashMap::from([(11, 10), (12, 11), (13, 10), (20, 1), (10, 1)]);
        let mut found = descendants_of(10, &parents);
        found.sort_unstable();
        assert_eq!(found, vec![11, 12, 13]);
    }

    #[test]
    fn test_descendants_exclude_root() {
        let parents = HashMap::from([(10, 10), (11, 10)]);
        assert_eq!(descendants_of(10, &parents), vec![11]);
        assert!(descendants_of(99, &parents).is_empty());
    }

    #[test]
    fn test_own_priority_is_readable() {
        assert!(get_priority(std::process::id()).is_ok());
    }

    #[test]
    fn test_process_table_contains_self() {
        let table = process_table();
        assert!(table.contains_key(&std::process::id()));
    }
}
