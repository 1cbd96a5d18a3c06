//! Bridge facade - the public surface of the crate.
//!
//! [`WorkletBridge`] composes the supervisor, duplex channel, and message
//! gateway behind configure/start/write/read/send/shutdown without exposing
//! any of them. Every operation resolves exactly once with a success value
//! or a [`BridgeError`]; nothing is retried internally and no failure is
//! swallowed.
//!
//! All state is scoped to one bridge instance. Independent bridges (e.g. in
//! tests) never interfere.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::bytes::Bytes;

use crate::bundle::BundleLocator;
use crate::channel::{ChannelError, DuplexChannel};
use crate::gateway::{GatewayError, MessageGateway};
use crate::launcher::{LaunchError, WorkletLauncher};
use crate::supervisor::{ConfigError, Supervisor, WorkletConfig, WorkletId, WorkletState};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform error surface for every bridge operation.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Bad bundle or memory limit. Fatal to start; not retryable without
    /// reconfiguration.
    #[error("configuration rejected: {0}")]
    Configuration(#[from] ConfigError),

    /// The runtime failed to start. The caller may retry after resolving
    /// the cause.
    #[error("worklet launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// Operation attempted outside the `Running` state. Caller bug.
    #[error("worklet is not running")]
    NotRunning,

    #[error("write failed: {0}")]
    Write(String),

    #[error("read failed: {0}")]
    Read(String),

    /// Channel torn down mid-operation. Terminal for that operation; the
    /// bridge itself stays addressable until `shutdown`.
    #[error("channel closed")]
    ChannelClosed,

    /// The worklet's outbound stream ended with no further data.
    #[error("worklet stream ended without further data")]
    EmptyStream,

    /// Gateway wait exceeded. The caller may resend.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// Malformed message or reply. Caller (or worklet contract) bug.
    #[error("malformed message: {0}")]
    Serialization(String),
}

impl From<ChannelError> for BridgeError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Write(m) => BridgeError::Write(m),
            ChannelError::Read(m) => BridgeError::Read(m),
            ChannelError::Closed => BridgeError::ChannelClosed,
            ChannelError::EmptyStream => BridgeError::EmptyStream,
        }
    }
}

impl From<GatewayError> for BridgeError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::MessageTooLarge { .. } | GatewayError::ReplyNotText => {
                BridgeError::Serialization(e.to_string())
            }
            GatewayError::Channel(c) => c.into(),
            GatewayError::Timeout(d) => BridgeError::Timeout(d),
        }
    }
}

/// Tunables for one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    reply_timeout: Duration,
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// How long `send` waits for the worklet's reply.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel + gateway for the currently running worklet. Present only while
/// the bridge is wired; dropped on shutdown or crash.
struct ActiveBridge {
    channel: Arc<DuplexChannel>,
    gateway: Arc<MessageGateway>,
}

/// Lifecycle and message-passing bridge to one sandboxed worklet.
pub struct WorkletBridge {
    supervisor: Arc<Supervisor>,
    active: Arc<RwLock<Option<ActiveBridge>>>,
    config: BridgeConfig,
}

impl WorkletBridge {
    pub fn new(locator: Arc<dyn BundleLocator>, launcher: Arc<dyn WorkletLauncher>) -> Self {
        Self::with_config(locator, launcher, BridgeConfig::new())
    }

    pub fn with_config(
        locator: Arc<dyn BundleLocator>,
        launcher: Arc<dyn WorkletLauncher>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            supervisor: Arc::new(Supervisor::new(locator, launcher)),
            active: Arc::new(RwLock::new(None)),
            config,
        }
    }

    /// Validate and store the worklet's launch configuration. No side
    /// effects; nothing is launched.
    pub async fn configure(
        &self,
        bundle_name: &str,
        bundle_kind: &str,
        memory_limit_mb: u32,
    ) -> Result<(), BridgeError> {
        self.supervisor
            .configure(WorkletConfig {
                bundle_name: bundle_name.to_string(),
                bundle_kind: bundle_kind.to_string(),
                memory_limit_mb,
            })
            .await?;
        Ok(())
    }

    /// Launch the configured worklet and wire the duplex channel to it.
    pub async fn start_worklet(&self) -> Result<(), BridgeError> {
        let mut active = self.active.write().await;

        let io = self.supervisor.start().await?;
        let channel = DuplexChannel::new(io.reader, io.writer);
        let gateway = Arc::new(MessageGateway::new(
            Arc::clone(&channel),
            self.config.reply_timeout,
        ));

        self.spawn_monitor(io.id, Arc::clone(&channel));

        // A stale entry left over from a crashed instance is replaced here;
        // its channel is already closed.
        *active = Some(ActiveBridge { channel, gateway });
        Ok(())
    }

    /// Watches the channel and degrades the supervisor when the worklet
    /// side vanishes outside an orderly shutdown.
    fn spawn_monitor(&self, id: WorkletId, channel: Arc<DuplexChannel>) {
        let supervisor = Arc::clone(&self.supervisor);
        let active = Arc::clone(&self.active);
        let mut closed = channel.closed();
        tokio::spawn(async move {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            supervisor.reap(id).await;
            let mut slot = active.write().await;
            if slot
                .as_ref()
                .is_some_and(|a| Arc::ptr_eq(&a.channel, &channel))
            {
                slot.take();
            }
        });
    }

    /// Transmit one buffer to the worklet's inbound stream.
    pub async fn write(&self, buffer: Bytes) -> Result<(), BridgeError> {
        let channel = self.channel().await?;
        channel.write(buffer).await.map_err(Into::into)
    }

    /// Resolve with the next whole chunk from the worklet's outbound stream.
    pub async fn read(&self) -> Result<Bytes, BridgeError> {
        let channel = self.channel().await?;
        channel.read().await.map_err(Into::into)
    }

    /// Send a textual message and wait for its correlated reply. Replies
    /// pair with requests strictly in send order; the worklet-side contract
    /// must answer in the order requests arrive.
    pub async fn send(&self, message: &str) -> Result<String, BridgeError> {
        let gateway = {
            let active = self.active.read().await;
            active
                .as_ref()
                .map(|a| Arc::clone(&a.gateway))
                .ok_or(BridgeError::NotRunning)?
        };
        gateway.send(message).await.map_err(Into::into)
    }

    /// Tear down the channel, then the worklet. All pending operations
    /// resolve with [`BridgeError::ChannelClosed`]. Idempotent.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let taken = self.active.write().await.take();
        if let Some(active) = taken {
            active.channel.close();
        }
        self.supervisor.shutdown().await;
        Ok(())
    }

    pub async fn state(&self) -> WorkletState {
        self.supervisor.state().await
    }

    /// Id of the running worklet instance, if any.
    pub async fn worklet_id(&self) -> Option<WorkletId> {
        self.supervisor.worklet_id().await
    }

    /// Wait until the active channel closes for any reason (shutdown or
    /// worklet exit). Returns immediately when nothing is running.
    pub async fn closed(&self) {
        let channel = {
            let active = self.active.read().await;
            active.as_ref().map(|a| Arc::clone(&a.channel))
        };
        let Some(channel) = channel else { return };
        let mut closed = channel.closed();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    async fn channel(&self) -> Result<Arc<DuplexChannel>, BridgeError> {
        let active = self.active.read().await;
        active
            .as_ref()
            .map(|a| Arc::clone(&a.channel))
            .ok_or(BridgeError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::bundle::DirBundleLocator;
    use crate::launcher::{EchoLauncher, LaunchedWorklet, WorkletInstance};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Counts launches so tests can assert nothing was started.
    struct CountingLauncher {
        inner: EchoLauncher,
        launches: AtomicUsize,
    }

    impl CountingLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: EchoLauncher,
                launches: AtomicUsize::new(0),
            })
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkletLauncher for CountingLauncher {
        async fn launch(
            &self,
            bundle: &crate::bundle::ResolvedBundle,
            memory_limit_mb: u32,
        ) -> Result<LaunchedWorklet, LaunchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.inner.launch(bundle, memory_limit_mb).await
        }
    }

    /// Launcher whose worklet side is gone before the first byte: the
    /// channel sees immediate end-of-stream, as after a runtime crash.
    struct DyingLauncher;

    struct NoopInstance;

    #[async_trait]
    impl WorkletInstance for NoopInstance {
        async fn terminate(&mut self) {}
    }

    #[async_trait]
    impl WorkletLauncher for DyingLauncher {
        async fn launch(
            &self,
            _bundle: &crate::bundle::ResolvedBundle,
            _memory_limit_mb: u32,
        ) -> Result<LaunchedWorklet, LaunchError> {
            let (host_side, worklet_side) = tokio::io::duplex(1024);
            drop(worklet_side);
            let (reader, writer) = tokio::io::split(host_side);
            Ok(LaunchedWorklet {
                reader: Box::new(reader),
                writer: Box::new(writer),
                instance: Box::new(NoopInstance),
            })
        }
    }

    fn bundle_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("extension.bundle"), b"worklet code").unwrap();
        dir
    }

    fn echo_bridge(dir: &tempfile::TempDir) -> WorkletBridge {
        WorkletBridge::new(
            Arc::new(DirBundleLocator::new(dir.path())),
            Arc::new(EchoLauncher),
        )
    }

    async fn running_echo_bridge(dir: &tempfile::TempDir) -> WorkletBridge {
        let bridge = echo_bridge(dir);
        bridge.configure("extension", "bundle", 64).await.unwrap();
        bridge.start_worklet().await.unwrap();
        bridge
    }

    #[tokio::test]
    async fn configure_start_shutdown_lifecycle() {
        init_tracing();
        let dir = bundle_dir();
        let bridge = echo_bridge(&dir);

        assert_eq!(bridge.state().await, WorkletState::Unconfigured);
        bridge.configure("extension", "bundle", 64).await.unwrap();
        assert_eq!(bridge.state().await, WorkletState::Configured);

        bridge.start_worklet().await.unwrap();
        assert_eq!(bridge.state().await, WorkletState::Running);
        assert!(bridge.worklet_id().await.is_some());

        bridge.shutdown().await.unwrap();
        assert_eq!(bridge.state().await, WorkletState::Stopped);
    }

    #[tokio::test]
    async fn second_start_fails_without_second_instance() {
        let dir = bundle_dir();
        let bridge = running_echo_bridge(&dir).await;
        let first_id = bridge.worklet_id().await;

        assert!(matches!(
            bridge.start_worklet().await,
            Err(BridgeError::Launch(LaunchError::AlreadyRunning))
        ));
        assert_eq!(bridge.worklet_id().await, first_id);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = bundle_dir();
        let bridge = running_echo_bridge(&dir).await;

        bridge.shutdown().await.unwrap();
        bridge.shutdown().await.unwrap();
        assert_eq!(bridge.state().await, WorkletState::Stopped);
    }

    #[tokio::test]
    async fn send_resolves_with_echoed_reply() {
        init_tracing();
        let dir = bundle_dir();
        let bridge = running_echo_bridge(&dir).await;

        assert_eq!(bridge.send("ping").await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn concurrent_sends_resolve_in_order() {
        let dir = bundle_dir();
        let bridge = Arc::new(running_echo_bridge(&dir).await);

        let a = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.send("a").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.send("b").await })
        };

        assert_eq!(a.await.unwrap().unwrap(), "a");
        assert_eq!(b.await.unwrap().unwrap(), "b");
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_through_echo() {
        let dir = bundle_dir();
        let bridge = running_echo_bridge(&dir).await;

        bridge.write(Bytes::from_static(b"\x00\x01binary")).await.unwrap();
        assert_eq!(&bridge.read().await.unwrap()[..], b"\x00\x01binary");
    }

    #[tokio::test]
    async fn operations_before_start_fail_not_running() {
        let dir = bundle_dir();
        let launcher = CountingLauncher::new();
        let bridge = WorkletBridge::new(
            Arc::new(DirBundleLocator::new(dir.path())),
            Arc::clone(&launcher) as Arc<dyn WorkletLauncher>,
        );
        bridge.configure("extension", "bundle", 64).await.unwrap();

        assert!(matches!(
            bridge.write(Bytes::from_static(b"x")).await,
            Err(BridgeError::NotRunning)
        ));
        assert!(matches!(bridge.read().await, Err(BridgeError::NotRunning)));
        assert!(matches!(
            bridge.send("x").await,
            Err(BridgeError::NotRunning)
        ));

        // No launch, hence no channel activity of any kind.
        assert_eq!(launcher.launches(), 0);
        assert_eq!(bridge.state().await, WorkletState::Configured);
    }

    #[tokio::test]
    async fn shutdown_resolves_all_pending_operations() {
        init_tracing();
        let dir = bundle_dir();
        let bridge = Arc::new(running_echo_bridge(&dir).await);

        // Three operations that can never complete on their own: the echo
        // worklet only speaks when spoken to.
        let mut pending = Vec::new();
        for _ in 0..3 {
            let bridge = Arc::clone(&bridge);
            pending.push(tokio::spawn(async move { bridge.read().await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        bridge.shutdown().await.unwrap();

        let all = tokio::time::timeout(Duration::from_secs(1), async {
            let mut results = Vec::new();
            for task in pending {
                results.push(task.await.unwrap());
            }
            results
        })
        .await
        .expect("pending operations must resolve in bounded time");

        assert_eq!(all.len(), 3);
        for result in all {
            assert!(matches!(result, Err(BridgeError::ChannelClosed)));
        }
    }

    #[tokio::test]
    async fn invalid_memory_limit_fails_before_any_launch() {
        let dir = bundle_dir();
        let launcher = CountingLauncher::new();
        let bridge = WorkletBridge::new(
            Arc::new(DirBundleLocator::new(dir.path())),
            Arc::clone(&launcher) as Arc<dyn WorkletLauncher>,
        );

        assert!(matches!(
            bridge.configure("extension", "bundle", 0).await,
            Err(BridgeError::Configuration(ConfigError::InvalidMemoryLimit))
        ));
        assert_eq!(launcher.launches(), 0);
        assert_eq!(bridge.state().await, WorkletState::Unconfigured);
    }

    #[tokio::test]
    async fn missing_bundle_fails_configure() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = echo_bridge(&dir);

        assert!(matches!(
            bridge.configure("extension", "bundle", 64).await,
            Err(BridgeError::Configuration(ConfigError::BundleNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn worklet_exit_degrades_bridge_to_stopped() {
        init_tracing();
        let dir = bundle_dir();
        let bridge = WorkletBridge::new(
            Arc::new(DirBundleLocator::new(dir.path())),
            Arc::new(DyingLauncher),
        );
        bridge.configure("extension", "bundle", 64).await.unwrap();
        bridge.start_worklet().await.unwrap();

        bridge.closed().await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while bridge.state().await != WorkletState::Stopped {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("supervisor must observe the worklet exit");

        // The dead bridge answers; it does not hang.
        assert!(matches!(
            bridge.read().await,
            Err(BridgeError::EmptyStream | BridgeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn reconfigure_after_shutdown_allows_restart() {
        let dir = bundle_dir();
        let bridge = echo_bridge(&dir);
        bridge.configure("extension", "bundle", 64).await.unwrap();
        bridge.start_worklet().await.unwrap();
        bridge.shutdown().await.unwrap();

        bridge.configure("extension", "bundle", 64).await.unwrap();
        bridge.start_worklet().await.unwrap();
        assert_eq!(bridge.send("again").await.unwrap(), "again");
    }

    #[tokio::test]
    async fn two_bridges_do_not_interfere() {
        let dir = bundle_dir();
        let first = running_echo_bridge(&dir).await;
        let second = running_echo_bridge(&dir).await;

        first.shutdown().await.unwrap();

        assert_eq!(second.send("still alive").await.unwrap(), "still alive");
        assert_eq!(first.state().await, WorkletState::Stopped);
        assert_eq!(second.state().await, WorkletState::Running);
    }

    #[tokio::test]
    async fn configured_reply_timeout_is_honored() {
        let dir = bundle_dir();
        let bridge = WorkletBridge::with_config(
            Arc::new(DirBundleLocator::new(dir.path())),
            Arc::new(DyingLauncher),
            BridgeConfig::new().with_reply_timeout(Duration::from_millis(20)),
        );
        bridge.configure("extension", "bundle", 64).await.unwrap();
        bridge.start_worklet().await.unwrap();

        // The dead worklet never replies; the send resolves either with the
        // short timeout or with the already-ended stream, never by hanging.
        let result = tokio::time::timeout(Duration::from_secs(1), bridge.send("hello")).await;
        assert!(result.expect("send must resolve").is_err());
    }

    #[test]
    fn error_text_is_stable() {
        insta::assert_snapshot!(BridgeError::NotRunning.to_string(), @"worklet is not running");
        insta::assert_snapshot!(BridgeError::ChannelClosed.to_string(), @"channel closed");
        insta::assert_snapshot!(
            BridgeError::from(ChannelError::EmptyStream).to_string(),
            @"worklet stream ended without further data"
        );
        insta::assert_snapshot!(
            BridgeError::Timeout(Duration::from_secs(30)).to_string(),
            @"no reply within 30s"
        );
    }
}
