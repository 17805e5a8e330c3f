//! Seam between the session manager and backend process creation.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::backend::process::BackendProcess;
use crate::config::BackendProfile;
use crate::Result;

/// Everything needed to start one backend for one session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Backend kind (profile name).
    pub kind: String,
    /// Launch profile.
    pub profile: BackendProfile,
    /// Session working directory.
    pub cwd: PathBuf,
    /// Final argument list.
    pub args: Vec<String>,
}

/// Starts backend connections.
///
/// Production code spawns subprocesses through [`ProcessLauncher`]; tests
/// substitute launchers that connect to in-process agents.
pub trait BackendLauncher: Send + Sync {
    /// Start a backend for `spec`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the backend cannot be started.
    fn launch<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<BackendProcess>> + Send + 'a>>;
}

/// Launcher that spawns the profile's command as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl BackendLauncher for ProcessLauncher {
    fn launch<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<BackendProcess>> + Send + 'a>> {
        Box::pin(async move { BackendProcess::start(&spec.kind, &spec.profile, &spec.cwd, &spec.args) })
    }
}
