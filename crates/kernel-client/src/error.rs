//! Error types for kernel connection operations.

/// Error type for REST calls against the kernel lifecycle API.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response payload: {0}")]
    InvalidPayload(String),
}

/// Error type for connection, future, and comm operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The kernel reached the terminal `dead` status; no further sends are
    /// possible on this connection.
    #[error("Kernel is dead")]
    Dead,

    /// The connection handle was disposed.
    #[error("Kernel connection is disposed")]
    ConnectionDisposed,

    /// The future was disposed before its reply/idle pair arrived.
    #[error("Future was disposed before completion")]
    FutureDisposed,

    /// The comm was closed or disposed; sends fail fast.
    #[error("Comm is closed")]
    CommClosed,

    #[error("Comm {0} already exists")]
    DuplicateComm(String),

    #[error("Comms are not supported by this connection")]
    CommsNotSupported,

    /// The kernel replied with `status: error` (or aborted the request).
    #[error("Kernel reply reported an error: {ename}: {evalue}")]
    ReplyError { ename: String, evalue: String },

    /// `reply_as` was called on a future sent with `expect_reply = false`.
    #[error("No reply was expected for this request")]
    NoReply,

    #[error("WebSocket error: {0}")]
    Socket(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed wire frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Rest(#[from] RestError),
}
