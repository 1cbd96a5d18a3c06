//! Launch seam for the sandboxed worklet runtime.
//!
//! The supervisor reaches the runtime only through [`WorkletLauncher`], so
//! the production subprocess launcher and the in-memory echo double are
//! interchangeable without touching anything above this seam.
//!
//! The memory ceiling is enforced at launch: [`ProcessLauncher`] hands the
//! limit to the runtime's allocator via the command line and the launch-info
//! environment variable. Breaches after launch surface as channel closure,
//! reported by the runtime itself.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use crate::bundle::ResolvedBundle;

/// Environment variable carrying [`WorkletLaunchInfo`] as JSON to the child.
pub const ENV_LAUNCH_INFO: &str = "VAULTLET_WORKLET_INFO";

pub type WorkletReader = Box<dyn AsyncRead + Send + Unpin>;
pub type WorkletWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Launch parameters handed to the child runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkletLaunchInfo {
    pub bundle_path: PathBuf,
    pub memory_limit_mb: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("worklet already running")]
    AlreadyRunning,

    #[error("no bundle configured")]
    NotConfigured,

    #[error("failed to spawn worklet runtime: {0}")]
    Spawn(String),
}

/// Termination control for a launched worklet instance.
#[async_trait]
pub trait WorkletInstance: Send + Sync {
    /// Force-terminate the instance. Safe to call after it already exited.
    async fn terminate(&mut self);
}

/// A freshly launched worklet: its duplex byte endpoints plus termination
/// control. The launcher retains nothing.
pub struct LaunchedWorklet {
    pub reader: WorkletReader,
    pub writer: WorkletWriter,
    pub instance: Box<dyn WorkletInstance>,
}

#[async_trait]
pub trait WorkletLauncher: Send + Sync {
    async fn launch(
        &self,
        bundle: &ResolvedBundle,
        memory_limit_mb: u32,
    ) -> Result<LaunchedWorklet, LaunchError>;
}

/// Launches the worklet runtime as a subprocess with piped stdin/stdout as
/// the duplex transport.
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl WorkletLauncher for ProcessLauncher {
    async fn launch(
        &self,
        bundle: &ResolvedBundle,
        memory_limit_mb: u32,
    ) -> Result<LaunchedWorklet, LaunchError> {
        let info = WorkletLaunchInfo {
            bundle_path: bundle.path.clone(),
            memory_limit_mb,
        };
        let info_json =
            serde_json::to_string(&info).map_err(|e| LaunchError::Spawn(e.to_string()))?;

        tracing::info!(
            program = %self.program.display(),
            bundle = %bundle.path.display(),
            memory_limit_mb,
            "Spawning worklet runtime"
        );

        let mut child = Command::new(&self.program)
            .arg(&bundle.path)
            .arg("--heap-limit-mb")
            .arg(memory_limit_mb.to_string())
            .env(ENV_LAUNCH_INFO, info_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaunchError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Spawn("stdout not captured".to_string()))?;

        Ok(LaunchedWorklet {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            instance: Box::new(ProcessInstance { child }),
        })
    }
}

struct ProcessInstance {
    child: tokio::process::Child,
}

#[async_trait]
impl WorkletInstance for ProcessInstance {
    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Worklet process already exited");
        }
    }
}

/// In-memory worklet that echoes every inbound byte back unchanged, which
/// preserves frame boundaries end to end. Substitutable for
/// [`ProcessLauncher`] in integration tests.
pub struct EchoLauncher;

#[async_trait]
impl WorkletLauncher for EchoLauncher {
    async fn launch(
        &self,
        bundle: &ResolvedBundle,
        memory_limit_mb: u32,
    ) -> Result<LaunchedWorklet, LaunchError> {
        tracing::debug!(bundle = %bundle.path.display(), memory_limit_mb, "Starting echo worklet");

        let (host_side, worklet_side) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(worklet_side);
            let _ = tokio::io::copy(&mut read, &mut write).await;
        });

        let (host_read, host_write) = tokio::io::split(host_side);
        Ok(LaunchedWorklet {
            reader: Box::new(host_read),
            writer: Box::new(host_write),
            instance: Box::new(TaskInstance { task }),
        })
    }
}

struct TaskInstance {
    task: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl WorkletInstance for TaskInstance {
    async fn terminate(&mut self) {
        self.task.abort();
    }
}
