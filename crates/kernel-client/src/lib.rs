//! kernel-client - Kernel connection and message-correlation engine.
//!
//! This crate owns a live connection to a remote compute kernel: it
//! serializes and deserializes the wire protocol, correlates asynchronous
//! requests with replies through [`ShellFuture`]s with cancelable
//! interception hooks, multiplexes comm sub-channels over the same socket,
//! and recovers from socket failures with bounded backoff while preserving
//! outstanding work.
//!
//! It is a library with no process entry point; kernel lifecycle HTTP
//! calls (interrupt, restart, shutdown, subshells) are issued through
//! [`KernelApiClient`] as part of connection management.
//!
//! ```no_run
//! use kernel_client::{ConnectOptions, KernelConnection, ServerSettings};
//! use kernel_client::messages::ExecuteRequest;
//!
//! # async fn demo() -> Result<(), kernel_client::KernelError> {
//! let settings = ServerSettings::new("http://127.0.0.1:8888");
//! let kernel = KernelConnection::start(settings, "python3", ConnectOptions::default()).await?;
//!
//! let future = kernel.request_execute(ExecuteRequest::new("a = 1"), true)?;
//! let _reply = future.done().await?;
//! # Ok(())
//! # }
//! ```

pub mod comm;
pub mod connection;
pub mod error;
pub mod future;
pub mod messages;
pub mod reconnect;
pub mod rest;
pub mod router;
pub mod serializer;

pub use comm::Comm;
pub use connection::{ConnectOptions, KernelConnection, MessageDirection, MessageEvent};
pub use error::{KernelError, RestError};
pub use future::{async_hook, sync_hook, MessageHook, ShellFuture};
pub use messages::{
    Channel, ConnectionStatus, ExecutionStatus, Header, KernelMessage, ReplyStatus,
};
pub use reconnect::ReconnectConfig;
pub use rest::{KernelApiClient, KernelModel, ServerSettings};
pub use router::CommTargetHandler;
pub use serializer::{serializer_for, MessageSerializer, WireFrame, V1_PROTOCOL};
