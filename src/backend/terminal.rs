//! Commands run on behalf of a backend through the `terminal/*` calls.
//!
//! Each terminal is a shell child with stdout and stderr captured into one
//! bounded buffer. A supervisor task owns the child; it publishes the exit
//! status only after the output pipes are drained, so a caller that sees an
//! exit status also sees the complete output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::schema::{CreateTerminalParams, TerminalExitStatus, TerminalOutput};
use crate::{AppError, Result};

/// Output retained per terminal when the agent sets no limit.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// How long the supervisor keeps reading after the child exits. Grandchildren
/// may hold the pipes open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append `chunk`, dropping the oldest output past the limit.
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.truncated = true;
    }
}

#[derive(Debug)]
struct Terminal {
    command: String,
    output: Arc<Mutex<OutputBuffer>>,
    exit: watch::Receiver<Option<TerminalExitStatus>>,
    kill: CancellationToken,
}

/// Terminals of one backend connection.
#[derive(Debug)]
pub struct TerminalManager {
    root: PathBuf,
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
    next_id: AtomicU64,
}

impl TerminalManager {
    /// Create a manager whose relative working directories resolve against
    /// `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            terminals: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a command and return its terminal id.
    ///
    /// The command line is `command` followed by `args`, run through the
    /// platform shell.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the shell cannot be started.
    pub async fn create(&self, params: CreateTerminalParams) -> Result<String> {
        let mut line = params.command.clone();
        for arg in &params.args {
            line.push(' ');
            line.push_str(arg);
        }
        let cwd = match params.cwd.as_deref() {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => self.root.join(dir),
            None => self.root.clone(),
        };

        let mut cmd = shell_command(&line);
        cmd.envs(params.env.iter().map(|var| (&var.name, &var.value)))
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|err| AppError::Spawn(format!("{line}: {err}")))?;

        let id = format!("term-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let output = Arc::new(Mutex::new(OutputBuffer::new(
            params.output_byte_limit.unwrap_or(DEFAULT_OUTPUT_LIMIT),
        )));
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        tokio::spawn(supervise(
            id.clone(),
            child,
            Arc::clone(&output),
            exit_tx,
            kill.clone(),
        ));

        info!(terminal = %id, session_id = %params.session_id, command = %line, cwd = %cwd.display(), "terminal created");
        self.terminals.lock().await.insert(
            id.clone(),
            Arc::new(Terminal {
                command: line,
                output,
                exit: exit_rx,
                kill,
            }),
        );
        Ok(id)
    }

    /// Output captured so far, with the exit status once the command ended.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for an unknown terminal id.
    pub async fn output(&self, id: &str) -> Result<TerminalOutput> {
        let terminal = self.get(id).await?;
        // Read the status first: once it is set the buffer is final.
        let exit_status = terminal.exit.borrow().clone();
        let buffer = terminal.output.lock().await;
        Ok(TerminalOutput {
            output: buffer.text.clone(),
            truncated: buffer.truncated,
            exit_status,
        })
    }

    /// Wait for the command to exit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for an unknown terminal id.
    pub async fn wait_for_exit(&self, id: &str) -> Result<TerminalExitStatus> {
        let terminal = self.get(id).await?;
        wait_exit(&terminal).await
    }

    /// Kill the command. The terminal and its output stay available.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for an unknown terminal id.
    pub async fn kill(&self, id: &str) -> Result<TerminalExitStatus> {
        let terminal = self.get(id).await?;
        terminal.kill.cancel();
        let status = wait_exit(&terminal).await?;
        debug!(terminal = id, command = %terminal.command, ?status, "terminal killed");
        Ok(status)
    }

    /// Kill the command if it is still running and forget the terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for an unknown terminal id.
    pub async fn release(&self, id: &str) -> Result<()> {
        let terminal = self
            .terminals
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| unknown(id))?;
        terminal.kill.cancel();
        debug!(terminal = id, "terminal released");
        Ok(())
    }

    /// Kill and forget every terminal. Returns how many were tracked.
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<Arc<Terminal>> = self.terminals.lock().await.drain().map(|(_, t)| t).collect();
        for terminal in &drained {
            terminal.kill.cancel();
        }
        drained.len()
    }

    async fn get(&self, id: &str) -> Result<Arc<Terminal>> {
        self.terminals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| unknown(id))
    }
}

fn unknown(id: &str) -> AppError {
    AppError::InvalidParams(format!("unknown terminal {id}"))
}

async fn wait_exit(terminal: &Terminal) -> Result<TerminalExitStatus> {
    let mut exit = terminal.exit.clone();
    let status = exit
        .wait_for(Option::is_some)
        .await
        .map_err(|_| AppError::Io(format!("supervisor of `{}` stopped", terminal.command)))?
        .clone();
    Ok(status.unwrap_or_default())
}

async fn supervise(
    id: String,
    mut child: Child,
    output: Arc<Mutex<OutputBuffer>>,
    exit_tx: watch::Sender<Option<TerminalExitStatus>>,
    kill: CancellationToken,
) {
    let mut captures = JoinSet::new();
    if let Some(stdout) = child.stdout.take() {
        captures.spawn(capture(stdout, Arc::clone(&output)));
    }
    if let Some(stderr) = child.stderr.take() {
        captures.spawn(capture(stderr, Arc::clone(&output)));
    }

    let waited = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                debug!(terminal = %id, %err, "kill failed");
            }
            child.wait().await
        }
    };

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while captures.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!(terminal = %id, "output pipes still open after exit");
    }

    let status = match waited {
        Ok(status) => exit_status(status),
        Err(err) => {
            warn!(terminal = %id, %err, "failed to wait for terminal command");
            TerminalExitStatus::default()
        }
    };
    debug!(terminal = %id, ?status, "terminal command exited");
    exit_tx.send_replace(Some(status));
}

async fn capture<R>(mut reader: R, output: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; 8192];
    // Bytes of a UTF-8 sequence split across reads.
    let mut carry: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        carry.extend_from_slice(&buf[..n]);
        let complete = match std::str::from_utf8(&carry) {
            Ok(_) => carry.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => carry.len(),
        };
        let text = String::from_utf8_lossy(&carry[..complete]).into_owned();
        carry.drain(..complete);
        output.lock().await.push(&text);
    }
    if !carry.is_empty() {
        output.lock().await.push(&String::from_utf8_lossy(&carry));
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

fn exit_status(status: ExitStatus) -> TerminalExitStatus {
    TerminalExitStatus {
        exit_code: status.code(),
        signal: signal_name(status),
    }
}

#[cfg(unix)]
fn signal_name(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let raw = status.signal()?;
    Some(
        nix::sys::signal::Signal::try_from(raw)
            .map_or_else(|_| raw.to_string(), |signal| signal.as_str().to_owned()),
    )
}

#[cfg(not(unix))]
fn signal_name(_status: ExitStatus) -> Option<String> {
    None
}
