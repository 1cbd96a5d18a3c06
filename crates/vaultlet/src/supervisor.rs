//! Runtime supervisor - owns the sandboxed worklet instance.
//!
//! Lifecycle: `Unconfigured → Configured → Running → Stopped`. `configure`
//! validates and stores without side effects; `start` launches at most one
//! instance and yields its transport endpoints; `shutdown` is idempotent.
//! Reconfiguring from `Stopped` returns the machine to `Configured` so a
//! bridge can be relaunched after shutdown or a crash.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bundle::{BundleLocator, ResolvedBundle};
use crate::launcher::{LaunchError, WorkletInstance, WorkletLauncher, WorkletReader, WorkletWriter};

/// Largest memory ceiling the platform will grant a worklet.
pub const PLATFORM_MEMORY_CEILING_MB: u32 = 4096;

/// Validated launch configuration for one worklet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkletConfig {
    pub bundle_name: String,
    pub bundle_kind: String,
    pub memory_limit_mb: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bundle {name}.{kind} could not be resolved")]
    BundleNotFound { name: String, kind: String },

    #[error("memory limit must be a positive number of megabytes")]
    InvalidMemoryLimit,

    #[error("memory limit {0} MB exceeds the {PLATFORM_MEMORY_CEILING_MB} MB platform ceiling")]
    MemoryLimitTooLarge(u32),

    #[error("cannot reconfigure while the worklet is running")]
    WorkletRunning,
}

/// Unique identifier for a launched worklet instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkletId(uuid::Uuid);

impl WorkletId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for WorkletId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state, observable through [`Supervisor::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkletState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

/// The running sandboxed instance. Exclusively owned by the supervisor;
/// created on `start`, destroyed on `shutdown`.
pub struct WorkletHandle {
    id: WorkletId,
    bundle: ResolvedBundle,
    memory_limit_mb: u32,
    instance: Box<dyn WorkletInstance>,
}

impl WorkletHandle {
    pub fn id(&self) -> WorkletId {
        self.id
    }

    pub fn bundle(&self) -> &ResolvedBundle {
        &self.bundle
    }

    pub fn memory_limit_mb(&self) -> u32 {
        self.memory_limit_mb
    }
}

enum State {
    Unconfigured,
    Configured {
        config: WorkletConfig,
        bundle: ResolvedBundle,
    },
    Running {
        handle: WorkletHandle,
    },
    Stopped,
}

impl State {
    fn as_worklet_state(&self) -> WorkletState {
        match self {
            State::Unconfigured => WorkletState::Unconfigured,
            State::Configured { .. } => WorkletState::Configured,
            State::Running { .. } => WorkletState::Running,
            State::Stopped => WorkletState::Stopped,
        }
    }
}

/// Transport endpoints for a freshly started worklet, handed to whoever
/// wires up the channel. The supervisor keeps only the termination control.
pub struct WorkletIo {
    pub id: WorkletId,
    pub reader: WorkletReader,
    pub writer: WorkletWriter,
}

pub struct Supervisor {
    locator: Arc<dyn BundleLocator>,
    launcher: Arc<dyn WorkletLauncher>,
    state: RwLock<State>,
}

impl Supervisor {
    pub fn new(locator: Arc<dyn BundleLocator>, launcher: Arc<dyn WorkletLauncher>) -> Self {
        Self {
            locator,
            launcher,
            state: RwLock::new(State::Unconfigured),
        }
    }

    pub async fn state(&self) -> WorkletState {
        self.state.read().await.as_worklet_state()
    }

    /// Id of the running instance, if any.
    pub async fn worklet_id(&self) -> Option<WorkletId> {
        match &*self.state.read().await {
            State::Running { handle } => Some(handle.id()),
            _ => None,
        }
    }

    /// Validate and store launch configuration. No side effects: nothing is
    /// launched and nothing is allocated.
    pub async fn configure(&self, config: WorkletConfig) -> Result<(), ConfigError> {
        if config.memory_limit_mb == 0 {
            return Err(ConfigError::InvalidMemoryLimit);
        }
        if config.memory_limit_mb > PLATFORM_MEMORY_CEILING_MB {
            return Err(ConfigError::MemoryLimitTooLarge(config.memory_limit_mb));
        }

        let path = self
            .locator
            .locate(&config.bundle_name, &config.bundle_kind)
            .ok_or_else(|| ConfigError::BundleNotFound {
                name: config.bundle_name.clone(),
                kind: config.bundle_kind.clone(),
            })?;
        let bundle = ResolvedBundle::new(&config.bundle_name, &config.bundle_kind, path);

        let mut state = self.state.write().await;
        if matches!(*state, State::Running { .. }) {
            return Err(ConfigError::WorkletRunning);
        }

        tracing::info!(
            bundle = %bundle.path.display(),
            memory_limit_mb = config.memory_limit_mb,
            "Worklet configured"
        );
        *state = State::Configured { config, bundle };
        Ok(())
    }

    /// Launch the configured bundle under its memory ceiling. Only valid
    /// from `Configured`; a second start while running fails without
    /// creating a second instance.
    pub async fn start(&self) -> Result<WorkletIo, LaunchError> {
        let mut state = self.state.write().await;

        let (config, bundle) = match &*state {
            State::Running { .. } => return Err(LaunchError::AlreadyRunning),
            State::Unconfigured | State::Stopped => return Err(LaunchError::NotConfigured),
            State::Configured { config, bundle } => (config.clone(), bundle.clone()),
        };

        let launched = self
            .launcher
            .launch(&bundle, config.memory_limit_mb)
            .await?;

        let id = WorkletId::new();
        let handle = WorkletHandle {
            id,
            bundle,
            memory_limit_mb: config.memory_limit_mb,
            instance: launched.instance,
        };
        tracing::info!(worklet_id = %id, "Worklet running");
        *state = State::Running { handle };

        Ok(WorkletIo {
            id,
            reader: launched.reader,
            writer: launched.writer,
        })
    }

    /// Terminate the instance and release its handle. Calling this when not
    /// running is a safe no-op. Returns whether a running instance was torn
    /// down.
    pub async fn shutdown(&self) -> bool {
        let mut state = self.state.write().await;
        match std::mem::replace(&mut *state, State::Stopped) {
            State::Running { mut handle } => {
                tracing::info!(worklet_id = %handle.id(), "Shutting worklet down");
                handle.instance.terminate().await;
                true
            }
            other => {
                // Nothing was running; keep whatever state we were in.
                *state = other;
                if matches!(*state, State::Stopped) {
                    tracing::debug!("Shutdown requested while already stopped");
                }
                false
            }
        }
    }

    /// Crash path: degrade `Running → Stopped` when the transport for
    /// instance `id` vanishes. A stale notification for an instance that is
    /// no longer the running one is ignored.
    pub async fn reap(&self, id: WorkletId) -> bool {
        let mut state = self.state.write().await;
        if !matches!(&*state, State::Running { handle } if handle.id() == id) {
            return false;
        }
        if let State::Running { mut handle } = std::mem::replace(&mut *state, State::Stopped) {
            tracing::warn!(worklet_id = %id, "Worklet exited; supervisor stopped");
            handle.instance.terminate().await;
        }
        true
    }
}
