//! vaultlet: lifecycle and message bridge to a sandboxed credential worklet.
//!
//! A host application uses [`WorkletBridge`] to launch an isolated scripting
//! worklet under a memory ceiling, exchange byte buffers and textual
//! request/reply messages with it over an ordered duplex channel, and tear
//! everything down race-free. The worklet itself is opaque: the bridge
//! neither knows nor cares what runs inside it.

mod bundle;
mod channel;
mod facade;
mod gateway;
mod launcher;
mod supervisor;

pub use bundle::{BundleLocator, DirBundleLocator, ResolvedBundle};
pub use channel::{ChannelError, DuplexChannel, MAX_FRAME_BYTES};
pub use facade::{BridgeConfig, BridgeError, DEFAULT_REPLY_TIMEOUT, WorkletBridge};
pub use gateway::{GatewayError, MessageGateway};
pub use launcher::{
    ENV_LAUNCH_INFO, EchoLauncher, LaunchError, LaunchedWorklet, ProcessLauncher, WorkletInstance,
    WorkletLaunchInfo, WorkletLauncher, WorkletReader, WorkletWriter,
};
pub use supervisor::{
    ConfigError, PLATFORM_MEMORY_CEILING_MB, Supervisor, WorkletConfig, WorkletHandle, WorkletId,
    WorkletIo, WorkletState,
};

pub use tokio_util::bytes::Bytes;
