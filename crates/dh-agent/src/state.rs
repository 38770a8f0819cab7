//! Agent state shared between concurrent tasks
//!
//! Tasks never call into each other's internals; they cooperate through
//! the three handles defined here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use dh_core::AgentConfig;

/// A running container-engine daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisedProcess {
    pub pid: u32,
    pub started_at: Instant,
}

impl SupervisedProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            started_at: Instant::now(),
        }
    }
}

/// Synchronized handle to the current daemon process
///
/// An empty handle is the single source of truth for "daemon is down".
/// At most one process is recorded at a time.
#[derive(Debug, Clone, Default)]
pub struct DaemonHandle {
    inner: Arc<Mutex<Option<SupervisedProcess>>>,
}

impl DaemonHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SupervisedProcess>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current process, if any
    pub fn get(&self) -> Option<SupervisedProcess> {
        *self.lock()
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Record a newly started process, returning the one it replaced
    pub fn set(&self, process: SupervisedProcess) -> Option<SupervisedProcess> {
        self.lock().replace(process)
    }

    pub fn clear(&self) -> Option<SupervisedProcess> {
        self.lock().take()
    }

    /// Clear the handle only if it still refers to `pid`
    ///
    /// Exit watchers use this so a late exit notification can never erase a
    /// process started after it.
    pub fn clear_if(&self, pid: u32) -> bool {
        let mut guard = self.lock();
        match *guard {
            Some(process) if process.pid == pid => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    /// Send `signal` to the current process
    ///
    /// Returns the PID signalled, or `None` when no process is recorded.
    pub fn signal(&self, signal: libc::c_int) -> Option<std::io::Result<u32>> {
        let process = self.get()?;
        Some(send_signal(process.pid, signal).map(|()| process.pid))
    }
}

/// Send a signal to a PID
pub fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Process-wide shutdown flags
///
/// Both flags start false and only ever move to true.
#[derive(Debug, Default)]
pub struct TerminationState {
    shutdown_requested: AtomicBool,
    forced: AtomicBool,
}

impl TerminationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark shutdown as requested; returns true for the first request only
    pub fn request_shutdown(&self) -> bool {
        !self.shutdown_requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn force(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.forced.store(true, Ordering::SeqCst);
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }
}

/// The agent configuration, shared between registration and the tunnel
///
/// Writers mutate the in-memory copy first and persist the snapshot
/// afterwards.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<AgentConfig>>,
}

impl SharedConfig {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> AgentConfig {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mutate the configuration under the write lock
    pub fn update<R>(&self, f: impl FnOnce(&mut AgentConfig) -> R) -> R {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}
