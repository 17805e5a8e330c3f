//! Backend process handle.
//!
//! Owns one spawned agent subprocess and its framed stdio. Writes are
//! serialized behind a single lock so concurrent senders never interleave
//! partial frames. The child is spawned with `kill_on_drop(true)`; dropping
//! the handle without calling [`BackendProcess::terminate`] still reaps it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::BackendProfile;
use crate::wire::{FrameCodec, Framing, Message};
use crate::{AppError, Result};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Framed duplex connection to one backend.
pub struct BackendProcess {
    label: String,
    reader: Mutex<FramedRead<BoxReader, FrameCodec>>,
    writer: Mutex<Option<FramedWrite<BoxWriter, FrameCodec>>>,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProcess")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl BackendProcess {
    /// Wrap an already-connected byte stream pair.
    ///
    /// Used for in-process agents; there is no child process to terminate.
    pub fn from_streams<R, W>(label: impl Into<String>, reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxReader = Box::new(reader);
        let writer: BoxWriter = Box::new(writer);
        Self {
            label: label.into(),
            reader: Mutex::new(FramedRead::new(reader, FrameCodec::new(framing))),
            writer: Mutex::new(Some(FramedWrite::new(writer, FrameCodec::new(framing)))),
            child: Mutex::new(None),
        }
    }

    /// Spawn the backend described by `profile` in `cwd`.
    ///
    /// The child's stderr is re-logged at `debug` under the backend label.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the process cannot be started or its
    /// stdio cannot be captured.
    pub fn start(label: &str, profile: &BackendProfile, cwd: &Path, args: &[String]) -> Result<Self> {
        let mut cmd = Command::new(&profile.command);
        cmd.args(args)
            .envs(&profile.env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Spawn(format!("{}: {err}", profile.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture backend stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture backend stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let backend = label.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(backend = %backend, "stderr: {line}");
                }
            });
        }

        info!(
            backend = label,
            command = %profile.command,
            ?args,
            pid = child.id(),
            "backend process started"
        );

        let mut process = Self::from_streams(label, stdout, stdin, profile.framing);
        process.child = Mutex::new(Some(child));
        Ok(process)
    }

    /// Label used in logs (the backend kind).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write one envelope as a single frame.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendGone` if stdin is closed or the write fails.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(framed) = guard.as_mut() else {
            return Err(AppError::BackendGone(format!(
                "{}: input stream closed",
                self.label
            )));
        };
        framed
            .send(message.to_json())
            .await
            .map_err(|err| AppError::BackendGone(format!("{}: write failed: {err}", self.label)))
    }

    /// Wait for the next inbound envelope.
    ///
    /// Payloads that are not valid JSON-RPC are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendGone` when the stream ends or a frame header
    /// cannot be decoded.
    pub async fn receive(&self) -> Result<Message> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                None => {
                    return Err(AppError::BackendGone(format!(
                        "{}: output stream closed",
                        self.label
                    )))
                }
                Some(Err(err)) => {
                    return Err(AppError::BackendGone(format!("{}: {err}", self.label)));
                }
                Some(Ok(payload)) => match Message::parse(&payload) {
                    Ok(message) => return Ok(message),
                    Err(err) => {
                        warn!(backend = %self.label, %err, "skipping malformed backend message");
                    }
                },
            }
        }
    }

    /// Close stdin, signal the child, and force-kill it after `timeout`.
    ///
    /// Best-effort and idempotent: a second call finds nothing to do.
    pub async fn terminate(&self, timeout: Duration) {
        if let Some(mut framed) = self.writer.lock().await.take() {
            // Flush whatever is buffered before stdin closes.
            let _ = framed.close().await;
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(backend = %self.label, ?status, "backend already exited");
            return;
        }

        signal_terminate(&child, &self.label);

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(backend = %self.label, ?status, "backend process exited");
            }
            Ok(Err(err)) => {
                warn!(backend = %self.label, %err, "error waiting for backend process");
            }
            Err(_elapsed) => {
                warn!(
                    backend = %self.label,
                    ?timeout,
                    "backend did not exit within grace period, forcing kill"
                );
                if let Err(err) = child.kill().await {
                    warn!(backend = %self.label, %err, "failed to force-kill backend process");
                }
            }
        }
    }
}

#[cfg(unix)]
fn signal_terminate(child: &Child, label: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(backend = label, %err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child, _label: &str) {}
