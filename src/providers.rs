//! Shared provider traits for dependency injection.
//!
//! This module contains the traits that stand between the pipeline and the
//! operating system: the clock and the process launcher. Tests swap them for
//! fixed clocks and recording launchers.

use chrono::{DateTime, Local};
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Trait for providing the current time.
///
/// # Example
///
/// ```
/// use shellmando::providers::{TimeProvider, SystemTimeProvider};
///
/// let provider = SystemTimeProvider;
/// let today = provider.now().format("%Y%m%d").to_string();
/// assert_eq!(today.len(), 8);
/// ```
pub trait TimeProvider: Send + Sync {
    /// Returns the current local time.
    fn now(&self) -> DateTime<Local>;
}

/// Default time provider using the system clock.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Trait for launching background processes.
pub trait ProcessLauncher: Send + Sync {
    /// Starts `program` with no arguments and returns its PID without waiting
    /// for it to finish.
    fn launch_detached(&self, program: &Path) -> io::Result<u32>;
}

/// Launches processes detached from the terminal: no inherited stdio and, on
/// Unix, a process group of their own so Ctrl-C aimed at us does not reach
/// the backend.
pub struct SystemProcessLauncher;

impl ProcessLauncher for SystemProcessLauncher {
    fn launch_detached(&self, program: &Path) -> io::Result<u32> {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        debug!("Launched {} with PID {}", program.display(), pid);
        // Fire and forget: the child is never awaited.
        drop(child);
        Ok(pid)
    }
}
