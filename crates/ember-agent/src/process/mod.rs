//! Shell command execution and background process lifecycle.

mod detect;
mod output;
mod supervisor;

pub use detect::{PatternMatcher, ServerMatcher};
pub use output::OutputBuffer;
pub use supervisor::{
    AutoStopped, InputOutcome, LogsOutcome, LogsReport, ProcessInfo, ProcessSupervisor,
    RunOutcome, StopOutcome, StopReport, SupervisorConfig,
};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

/// The tracked working directory, shared by the supervisor and the file tools.
#[derive(Debug, Clone)]
pub struct WorkingDir(Arc<RwLock<PathBuf>>);

impl WorkingDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(Arc::new(RwLock::new(path.into())))
    }

    pub fn get(&self) -> PathBuf {
        self.0.read().clone()
    }

    pub fn set(&self, path: impl Into<PathBuf>) {
        *self.0.write() = path.into();
    }

    /// Resolve a user-supplied path: `~` expands to the home directory and
    /// relative paths are taken from the tracked directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let expanded = if path == "~" {
            dirs::home_dir()
        } else if let Some(rest) = path.strip_prefix("~/") {
            dirs::home_dir().map(|home| home.join(rest))
        } else {
            None
        };
        let path = expanded.unwrap_or_else(|| PathBuf::from(path));
        if path.is_absolute() {
            path
        } else {
            self.get().join(path)
        }
    }
}
