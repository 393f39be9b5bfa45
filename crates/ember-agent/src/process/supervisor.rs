//! Process supervisor.
//!
//! Every command starts in the foreground. If it finishes within the foreground
//! timeout its result is returned directly; otherwise it is promoted to a
//! background process with a `bg_N` id and keeps running under a monitor task.
//! Background entries survive natural exit and are only removed by [`ProcessSupervisor::stop`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use super::output::tail_chars;
use super::{OutputBuffer, PatternMatcher, ServerMatcher, WorkingDir};

/// Tunables for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a command may run before it is promoted to the background
    pub foreground_timeout: Duration,
    /// Time between the graceful signal and the forced kill
    pub grace_period: Duration,
    /// How long `send_input` waits for the process to react
    pub input_settle: Duration,
    /// Size of the output preview returned when a command is backgrounded
    pub preview_chars: usize,
    /// Output returned by foreground completion and by `stop`
    pub result_chars: usize,
    /// Per-process output retained in memory
    pub buffer_chars: usize,
    /// Lines returned by `logs` when the caller does not ask for a number
    pub default_tail_lines: usize,
    /// Lines returned after `send_input`
    pub input_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            foreground_timeout: Duration::from_secs(15),
            grace_period: Duration::from_secs(3),
            input_settle: Duration::from_millis(1500),
            preview_chars: 300,
            result_chars: 10_000,
            buffer_chars: 256 * 1024,
            default_tail_lines: 50,
            input_tail_lines: 20,
        }
    }
}

/// Shared record of a spawned command. Only the supervisor and the command's
/// own monitor task touch it.
struct BackgroundProcess {
    command: String,
    cwd: PathBuf,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    output: OutputBuffer,
    running: bool,
    exit_code: Option<i32>,
    port: Option<u16>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    kill_tx: Option<mpsc::Sender<()>>,
}

impl BackgroundProcess {
    fn runtime(&self) -> Duration {
        match self.finished {
            Some(end) => end.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }
}

#[derive(Clone)]
struct Entry {
    id: String,
    state: Arc<RwLock<BackgroundProcess>>,
    exited: watch::Receiver<bool>,
}

/// A server that was stopped to make room for a new launch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoStopped {
    pub id: String,
    pub command: String,
    pub port: Option<u16>,
}

/// Result of [`ProcessSupervisor::run`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Finished within the foreground timeout
    Completed {
        command: String,
        cwd: PathBuf,
        exit_code: Option<i32>,
        output: String,
        auto_stopped: Option<AutoStopped>,
    },
    /// Still running after the foreground timeout
    Backgrounded {
        id: String,
        command: String,
        cwd: PathBuf,
        pid: Option<u32>,
        port: Option<u16>,
        preview: String,
        auto_stopped: Option<AutoStopped>,
    },
    /// A bare `cd` moved the tracked directory
    DirectoryChanged { cwd: PathBuf },
    /// The command could not be started
    Failed {
        command: String,
        cwd: PathBuf,
        error: String,
    },
}

/// Final state of a stopped process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReport {
    pub id: String,
    pub command: String,
    pub was_running: bool,
    /// Whether the graceful signal had to be followed by a kill
    pub forced: bool,
    pub exit_code: Option<i32>,
    pub runtime: Duration,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped(StopReport),
    NotFound { id: String, known: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogsReport {
    pub id: String,
    pub command: String,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub port: Option<u16>,
    pub runtime: Duration,
    /// Bytes of output received so far
    pub output_bytes: usize,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LogsOutcome {
    Found(LogsReport),
    NotFound { id: String, known: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InputOutcome {
    /// Input was written; `output` is the recent tail
    Sent { id: String, output: String },
    NotRunning { id: String, exit_code: Option<i32> },
    /// The process no longer accepts input
    InputClosed { id: String },
    NotFound { id: String, known: Vec<String> },
}

/// Row of [`ProcessSupervisor::list`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub command: String,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub runtime: Duration,
    pub started_at: DateTime<Utc>,
}

/// Matches a command that is nothing but a directory change.
static BARE_CD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*cd(?:\s+(.+?))?\s*$").ok());

fn bare_cd_target(command: &str) -> Option<Option<&str>> {
    if command.contains(['&', ';', '|', '\n', '`', '$', '>', '<']) {
        return None;
    }
    let caps = BARE_CD.as_ref()?.captures(command)?;
    Some(caps.get(1).map(|m| m.as_str()))
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return inner;
        }
    }
    s
}

fn parse_id(id: &str) -> Option<u64> {
    id.trim().strip_prefix("bg_")?.parse().ok()
}

/// Signal the process group led by `pid`: SIGTERM, or SIGKILL when `force` is set.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, force: bool) -> bool {
    let Some(Ok(pid)) = pid.map(libc::pid_t::try_from) else {
        return false;
    };
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    // Negative pid addresses the whole group created at spawn
    unsafe { libc::kill(-pid, signal) == 0 }
}

/// Without process groups the monitor's kill channel is the only lever.
#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _force: bool) -> bool {
    false
}

async fn wait_exited(mut exited: watch::Receiver<bool>) {
    let _ = exited.wait_for(|done| *done).await;
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(String::from_utf8_lossy(&buf[..n]).into_owned()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Owns every spawned command and the tracked working directory.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    matcher: Arc<dyn ServerMatcher>,
    cwd: WorkingDir,
    registry: Mutex<BTreeMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(cwd: WorkingDir, config: SupervisorConfig) -> Self {
        Self::with_matcher(cwd, config, Arc::new(PatternMatcher))
    }

    pub fn with_matcher(
        cwd: WorkingDir,
        config: SupervisorConfig,
        matcher: Arc<dyn ServerMatcher>,
    ) -> Self {
        Self {
            config,
            matcher,
            cwd,
            registry: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Handle to the tracked working directory
    pub fn working_dir(&self) -> &WorkingDir {
        &self.cwd
    }

    pub fn cwd(&self) -> PathBuf {
        self.cwd.get()
    }

    /// Ids of all registered processes, oldest first
    pub fn ids(&self) -> Vec<String> {
        self.registry.lock().values().map(|e| e.id.clone()).collect()
    }

    fn entry(&self, id: &str) -> Option<Entry> {
        let seq = parse_id(id)?;
        self.registry.lock().get(&seq).cloned()
    }

    /// Run `command` through the shell.
    ///
    /// `working_dir` is resolved against the tracked directory. Server launches
    /// first stop one running server they would collide with.
    pub async fn run(&self, command: &str, working_dir: Option<&str>) -> RunOutcome {
        if let Some(target) = bare_cd_target(command) {
            return self.change_dir(command, target).await;
        }

        let cwd = match working_dir {
            Some(dir) => self.cwd.resolve(strip_quotes(dir)),
            None => self.cwd.get(),
        };
        if !cwd.is_dir() {
            return RunOutcome::Failed {
                command: command.to_string(),
                error: format!("working directory does not exist: {}", cwd.display()),
                cwd,
            };
        }

        let auto_stopped = if self.matcher.server_kind(command).is_some() {
            self.stop_compatible_server(command).await
        } else {
            None
        };

        let child = match spawn_shell(command, &cwd) {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome::Failed {
                    command: command.to_string(),
                    cwd,
                    error: format!("failed to spawn: {e}"),
                };
            }
        };

        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(32);
        let (kill_tx, kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = watch::channel(false);

        let state = Arc::new(RwLock::new(BackgroundProcess {
            command: command.to_string(),
            cwd: cwd.clone(),
            pid: child.id(),
            started_at: Utc::now(),
            started: Instant::now(),
            finished: None,
            output: OutputBuffer::new(self.config.buffer_chars),
            running: true,
            exit_code: None,
            port: None,
            stdin_tx: Some(stdin_tx),
            kill_tx: Some(kill_tx),
        }));

        spawn_monitor(child, state.clone(), stdin_rx, kill_rx, exit_tx);

        let finished = tokio::select! {
            _ = wait_exited(exit_rx.clone()) => true,
            _ = tokio::time::sleep(self.config.foreground_timeout) => false,
        };

        if finished {
            let s = state.read();
            return RunOutcome::Completed {
                command: s.command.clone(),
                cwd: s.cwd.clone(),
                exit_code: s.exit_code,
                output: tail_chars(s.output.as_str(), self.config.result_chars),
                auto_stopped,
            };
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("bg_{seq}");
        let (pid, port, preview) = {
            let mut s = state.write();
            s.port = self
                .matcher
                .detect_port(command)
                .or_else(|| self.matcher.detect_port(s.output.as_str()));
            (s.pid, s.port, s.output.tail_chars(self.config.preview_chars))
        };

        self.registry.lock().insert(
            seq,
            Entry {
                id: id.clone(),
                state,
                exited: exit_rx,
            },
        );
        tracing::debug!(id = %id, command, ?port, "Command promoted to background");

        RunOutcome::Backgrounded {
            id,
            command: command.to_string(),
            cwd,
            pid,
            port,
            preview,
            auto_stopped,
        }
    }

    async fn change_dir(&self, command: &str, target: Option<&str>) -> RunOutcome {
        let current = self.cwd.get();
        let path = match target.map(strip_quotes) {
            None | Some("") | Some("~") => match dirs::home_dir() {
                Some(home) => home,
                None => {
                    return RunOutcome::Failed {
                        command: command.to_string(),
                        cwd: current,
                        error: "cd: home directory is unknown".to_string(),
                    };
                }
            },
            Some(dir) => self.cwd.resolve(dir),
        };

        match tokio::fs::canonicalize(&path).await {
            Ok(resolved) if resolved.is_dir() => {
                tracing::debug!(from = %current.display(), to = %resolved.display(), "Working directory changed");
                self.cwd.set(&resolved);
                RunOutcome::DirectoryChanged { cwd: resolved }
            }
            _ => RunOutcome::Failed {
                command: command.to_string(),
                cwd: current,
                error: format!("cd: no such directory: {}", path.display()),
            },
        }
    }

    async fn stop_compatible_server(&self, command: &str) -> Option<AutoStopped> {
        let target = self.registry.lock().values().find_map(|e| {
            let s = e.state.read();
            (s.running && self.matcher.is_compatible(command, &s.command))
                .then(|| (e.id.clone(), s.command.clone(), s.port))
        });

        let (id, old_command, port) = target?;
        tracing::info!(id = %id, command = %old_command, "Stopping running server before relaunch");
        match self.stop(&id).await {
            StopOutcome::Stopped(_) => Some(AutoStopped {
                id,
                command: old_command,
                port,
            }),
            StopOutcome::NotFound { .. } => None,
        }
    }

    /// Terminate (if running) and forget a background process, returning its output.
    pub async fn stop(&self, id: &str) -> StopOutcome {
        let removed = parse_id(id).and_then(|seq| self.registry.lock().remove(&seq));
        let Some(entry) = removed else {
            return StopOutcome::NotFound {
                id: id.to_string(),
                known: self.ids(),
            };
        };

        let was_running = entry.state.read().running;
        let forced = if was_running {
            self.terminate(&entry).await
        } else {
            false
        };

        let s = entry.state.read();
        StopOutcome::Stopped(StopReport {
            id: entry.id.clone(),
            command: s.command.clone(),
            was_running,
            forced,
            exit_code: s.exit_code,
            runtime: s.runtime(),
            output: s.output.tail_chars(self.config.result_chars),
        })
    }

    /// Graceful signal, then a kill after the grace period. Returns whether the kill was needed.
    async fn terminate(&self, entry: &Entry) -> bool {
        let pid = entry.state.read().pid;

        signal_group(pid, false);

        let grace = self.config.grace_period;
        if tokio::time::timeout(grace, wait_exited(entry.exited.clone()))
            .await
            .is_ok()
        {
            return false;
        }

        tracing::debug!(id = %entry.id, "Process ignored graceful stop, killing");
        signal_group(pid, true);
        let kill_tx = entry.state.read().kill_tx.clone();
        if let Some(tx) = kill_tx {
            let _ = tx.try_send(());
        }
        let _ = tokio::time::timeout(grace, wait_exited(entry.exited.clone())).await;
        true
    }

    /// Status and the last `tail_lines` lines of output. Never changes the process,
    /// but remembers a port first seen in the output.
    pub fn logs(&self, id: &str, tail_lines: Option<usize>) -> LogsOutcome {
        let Some(entry) = self.entry(id) else {
            return LogsOutcome::NotFound {
                id: id.to_string(),
                known: self.ids(),
            };
        };
        let mut s = entry.state.write();
        // A server often prints its URL only after it was backgrounded
        if s.port.is_none() {
            let detected = self.matcher.detect_port(s.output.as_str());
            s.port = detected;
        }
        let lines = tail_lines.unwrap_or(self.config.default_tail_lines);
        LogsOutcome::Found(LogsReport {
            id: entry.id.clone(),
            command: s.command.clone(),
            running: s.running,
            exit_code: s.exit_code,
            port: s.port,
            runtime: s.runtime(),
            output_bytes: s.output.total_bytes(),
            output: s.output.tail(lines),
        })
    }

    /// Write `input` to the process's stdin, wait briefly, and return recent output.
    pub async fn send_input(&self, id: &str, input: &str) -> InputOutcome {
        let Some(entry) = self.entry(id) else {
            return InputOutcome::NotFound {
                id: id.to_string(),
                known: self.ids(),
            };
        };

        let stdin_tx = {
            let s = entry.state.read();
            if !s.running {
                return InputOutcome::NotRunning {
                    id: entry.id.clone(),
                    exit_code: s.exit_code,
                };
            }
            s.stdin_tx.clone()
        };
        let Some(stdin_tx) = stdin_tx else {
            return InputOutcome::InputClosed { id: entry.id };
        };

        let mut data = input.as_bytes().to_vec();
        if !input.ends_with('\n') {
            data.push(b'\n');
        }
        if stdin_tx.send(data).await.is_err() {
            return InputOutcome::InputClosed { id: entry.id };
        }

        tokio::time::sleep(self.config.input_settle).await;
        let output = entry.state.read().output.tail(self.config.input_tail_lines);
        InputOutcome::Sent {
            id: entry.id,
            output,
        }
    }

    /// Snapshot of every registered process, oldest first.
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.registry
            .lock()
            .values()
            .map(|e| {
                let s = e.state.read();
                ProcessInfo {
                    id: e.id.clone(),
                    command: s.command.clone(),
                    running: s.running,
                    exit_code: s.exit_code,
                    pid: s.pid,
                    port: s.port,
                    runtime: s.runtime(),
                    started_at: s.started_at,
                }
            })
            .collect()
    }

    /// Stop everything; used on shutdown.
    pub async fn stop_all(&self) {
        for id in self.ids() {
            let _ = self.stop(&id).await;
        }
    }
}

fn spawn_shell(command: &str, cwd: &Path) -> std::io::Result<Child> {
    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let mut cmd = Command::new(shell);
    cmd.arg(shell_arg)
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group, so stop reaches grandchildren (npm -> node -> esbuild)
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    cmd.spawn()
}

/// Start the reader, drain and stdin tasks for a freshly spawned child, plus the
/// task that owns the child until it exits.
///
/// Both output pipes feed one channel and a single drain task appends to the
/// shared buffer, so output is captured from the first byte.
fn spawn_monitor(
    mut child: Child,
    state: Arc<RwLock<BackgroundProcess>>,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<bool>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let stdout_task = stdout.map(|s| tokio::spawn(pump(s, out_tx.clone())));
    let stderr_task = stderr.map(|s| tokio::spawn(pump(s, out_tx.clone())));
    drop(out_tx);

    let drain_state = state.clone();
    let drain = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            drain_state.write().output.push(&chunk);
        }
    });

    let stdin_task = tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        }
    });

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            Some(()) = kill_rx.recv() => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };

        // Grandchildren may hold the pipes open; don't wait on them forever
        let readers = async {
            if let Some(t) = stdout_task {
                let _ = t.await;
            }
            if let Some(t) = stderr_task {
                let _ = t.await;
            }
            let _ = drain.await;
        };
        if tokio::time::timeout(Duration::from_secs(2), readers)
            .await
            .is_err()
        {
            tracing::debug!("Output pipes still open after process exit");
        }
        stdin_task.abort();

        {
            let mut s = state.write();
            s.running = false;
            s.exit_code = status.and_then(|st| st.code());
            s.finished = Some(Instant::now());
            s.stdin_tx = None;
            s.kill_tx = None;
        }
        exit_tx.send_replace(true);
    });
}
