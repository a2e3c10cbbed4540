//! Wire protocol message model.
//!
//! Value types for the kernel messaging protocol: the message envelope
//! (header, parent header, channel, content, binary buffers) and typed
//! content structs for the requests and replies the connection sugars over.
//!
//! Messages are immutable once constructed, with one exception: the sender
//! of a synthetic message may late-bind `parent_header` exactly once via
//! [`KernelMessage::set_parent`]. Replies and iopub/stdin traffic correlate
//! to the originating request by `parent_header.msg_id`.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol version advertised in outgoing message headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Message header carried by every protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    pub session: String,
    pub username: String,
    pub date: String,
    pub version: String,
}

impl Header {
    /// Create a header with a fresh v4 msg_id and the current RFC3339 date.
    pub fn new(msg_type: &str, session: &str, username: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            session: session.to_string(),
            username: username.to_string(),
            date: Utc::now().to_rfc3339(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Logical channels multiplexed over the single transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Request/reply channel.
    Shell,
    /// Broadcast output channel.
    IOPub,
    /// Interactive input channel.
    Stdin,
    /// Kernel control channel (carried on the wire; not routed by this core).
    Control,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Shell => write!(f, "shell"),
            Channel::IOPub => write!(f, "iopub"),
            Channel::Stdin => write!(f, "stdin"),
            Channel::Control => write!(f, "control"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(Channel::Shell),
            "iopub" => Ok(Channel::IOPub),
            "stdin" => Ok(Channel::Stdin),
            "control" => Ok(Channel::Control),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

/// A protocol message.
///
/// `content` is the message-type-specific payload; typed views are provided
/// by the content structs below via [`KernelMessage::parsed_content`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: Header,
    pub parent_header: Option<Header>,
    pub channel: Channel,
    pub metadata: Value,
    pub content: Value,
    #[serde(default, skip_serializing, skip_deserializing)]
    pub buffers: Vec<Bytes>,
}

impl KernelMessage {
    /// Build a new message with a fresh header on the given channel.
    pub fn new(msg_type: &str, channel: Channel, content: Value, session: &str, username: &str) -> Self {
        Self {
            header: Header::new(msg_type, session, username),
            parent_header: None,
            channel,
            metadata: Value::Object(Default::default()),
            content,
            buffers: Vec::new(),
        }
    }

    /// Attach binary buffers to the message.
    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    /// One-time late-bind of the parent header.
    ///
    /// Messages are otherwise immutable; a second call is ignored.
    pub fn set_parent(&mut self, parent: Header) {
        if self.parent_header.is_some() {
            warn!(
                "[messages] Ignoring second parent bind on msg {}",
                self.header.msg_id
            );
            return;
        }
        self.parent_header = Some(parent);
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The `msg_id` of the request this message correlates to, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// Deserialize the content payload into a typed struct.
    pub fn parsed_content<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.content.clone())
    }

    /// True for `comm_open`, `comm_msg`, and `comm_close`.
    pub fn is_comm_message(&self) -> bool {
        matches!(
            self.header.msg_type.as_str(),
            CommOpen::MSG_TYPE | CommMsg::MSG_TYPE | CommClose::MSG_TYPE
        )
    }

    /// The execution state carried by a `status` message, if this is one.
    pub fn execution_status(&self) -> Option<ExecutionStatus> {
        if self.header.msg_type != Status::MSG_TYPE {
            return None;
        }
        self.parsed_content::<Status>()
            .ok()
            .map(|s| s.execution_state)
    }
}

/// Kernel execution status, driven by inbound `status` iopub messages and
/// local failure detection. `Dead` is sticky: once reached, no further
/// sends are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Unknown,
    Starting,
    Idle,
    Busy,
    Restarting,
    Autorestarting,
    Dead,
}

impl ExecutionStatus {
    /// Whether the status permits sending new requests.
    pub fn can_send(self) -> bool {
        self != ExecutionStatus::Dead
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Unknown => write!(f, "unknown"),
            ExecutionStatus::Starting => write!(f, "starting"),
            ExecutionStatus::Idle => write!(f, "idle"),
            ExecutionStatus::Busy => write!(f, "busy"),
            ExecutionStatus::Restarting => write!(f, "restarting"),
            ExecutionStatus::Autorestarting => write!(f, "autorestarting"),
            ExecutionStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Transport status, independent of kernel execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Reply status reported by the kernel for shell replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    #[default]
    Ok,
    Error,
    Aborted,
}

// ============================================================================
// Typed content payloads
// ============================================================================

/// `status` iopub content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub execution_state: ExecutionStatus,
}

impl Status {
    pub const MSG_TYPE: &'static str = "status";
}

/// `stream` iopub content (stdout/stderr text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: String,
    pub text: String,
}

impl StreamContent {
    pub const MSG_TYPE: &'static str = "stream";
}

/// `execute_request` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Value,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub const MSG_TYPE: &'static str = "execute_request";

    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: Value::Object(Default::default()),
            allow_stdin: true,
            stop_on_error: true,
        }
    }
}

/// `execute_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub execution_count: Option<i64>,
}

impl ExecuteReply {
    pub const MSG_TYPE: &'static str = "execute_reply";
}

/// `kernel_info_request` content (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelInfoRequest {}

impl KernelInfoRequest {
    pub const MSG_TYPE: &'static str = "kernel_info_request";
}

/// `kernel_info_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelInfoReply {
    #[serde(default)]
    pub status: ReplyStatus,
    pub protocol_version: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub implementation_version: String,
    #[serde(default)]
    pub language_info: Value,
    #[serde(default)]
    pub banner: String,
    #[serde(default)]
    pub help_links: Vec<Value>,
    /// Whether the kernel supports subshell requests (protocol extension).
    #[serde(default)]
    pub supported_features: Vec<String>,
}

impl KernelInfoReply {
    pub const MSG_TYPE: &'static str = "kernel_info_reply";
}

/// `complete_request` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub code: String,
    pub cursor_pos: usize,
}

impl CompleteRequest {
    pub const MSG_TYPE: &'static str = "complete_request";
}

/// `complete_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteReply {
    #[serde(default)]
    pub status: ReplyStatus,
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
    #[serde(default)]
    pub metadata: Value,
}

impl CompleteReply {
    pub const MSG_TYPE: &'static str = "complete_reply";
}

/// `inspect_request` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectRequest {
    pub code: String,
    pub cursor_pos: usize,
    pub detail_level: u8,
}

impl InspectRequest {
    pub const MSG_TYPE: &'static str = "inspect_request";
}

/// `inspect_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectReply {
    #[serde(default)]
    pub status: ReplyStatus,
    pub found: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl InspectReply {
    pub const MSG_TYPE: &'static str = "inspect_reply";
}

/// `is_complete_request` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsCompleteRequest {
    pub code: String,
}

impl IsCompleteRequest {
    pub const MSG_TYPE: &'static str = "is_complete_request";
}

/// `is_complete_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsCompleteReply {
    /// One of `complete`, `incomplete`, `invalid`, `unknown`.
    pub status: String,
    #[serde(default)]
    pub indent: Option<String>,
}

impl IsCompleteReply {
    pub const MSG_TYPE: &'static str = "is_complete_reply";
}

/// `history_request` content, tagged by access type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "hist_access_type", rename_all = "lowercase")]
pub enum HistoryRequest {
    Range {
        session: i64,
        start: i64,
        stop: i64,
        output: bool,
        raw: bool,
    },
    Tail {
        n: i64,
        output: bool,
        raw: bool,
    },
    Search {
        pattern: String,
        unique: bool,
        n: i64,
        output: bool,
        raw: bool,
    },
}

impl HistoryRequest {
    pub const MSG_TYPE: &'static str = "history_request";
}

/// `history_reply` content. Entries are heterogeneous
/// `(session, line, input)` or `(session, line, (input, output))` tuples,
/// kept as raw values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryReply {
    #[serde(default)]
    pub status: ReplyStatus,
    #[serde(default)]
    pub history: Vec<Value>,
}

impl HistoryReply {
    pub const MSG_TYPE: &'static str = "history_reply";
}

/// `comm_info_request` content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommInfoRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

impl CommInfoRequest {
    pub const MSG_TYPE: &'static str = "comm_info_request";
}

/// One entry in a `comm_info_reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommTargetInfo {
    pub target_name: String,
}

/// `comm_info_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommInfoReply {
    #[serde(default)]
    pub status: ReplyStatus,
    #[serde(default)]
    pub comms: HashMap<String, CommTargetInfo>,
}

impl CommInfoReply {
    pub const MSG_TYPE: &'static str = "comm_info_reply";
}

/// `input_request` stdin content (kernel asking for user input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

impl InputRequest {
    pub const MSG_TYPE: &'static str = "input_request";
}

/// `input_reply` stdin content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputReply {
    pub value: String,
}

impl InputReply {
    pub const MSG_TYPE: &'static str = "input_reply";
}

/// `comm_open` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommOpen {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub data: Value,
}

impl CommOpen {
    pub const MSG_TYPE: &'static str = "comm_open";
}

/// `comm_msg` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommMsg {
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

impl CommMsg {
    pub const MSG_TYPE: &'static str = "comm_msg";
}

/// `comm_close` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommClose {
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

impl CommClose {
    pub const MSG_TYPE: &'static str = "comm_close";
}

/// `create_subshell_request` content (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSubshellRequest {}

impl CreateSubshellRequest {
    pub const MSG_TYPE: &'static str = "create_subshell_request";
}

/// `create_subshell_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubshellReply {
    #[serde(default)]
    pub status: ReplyStatus,
    pub subshell_id: String,
}

impl CreateSubshellReply {
    pub const MSG_TYPE: &'static str = "create_subshell_reply";
}

/// `delete_subshell_request` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSubshellRequest {
    pub subshell_id: String,
}

impl DeleteSubshellRequest {
    pub const MSG_TYPE: &'static str = "delete_subshell_request";
}

/// `delete_subshell_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSubshellReply {
    #[serde(default)]
    pub status: ReplyStatus,
}

impl DeleteSubshellReply {
    pub const MSG_TYPE: &'static str = "delete_subshell_reply";
}

/// `list_subshell_request` content (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSubshellRequest {}

impl ListSubshellRequest {
    pub const MSG_TYPE: &'static str = "list_subshell_request";
}

/// `list_subshell_reply` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSubshellReply {
    #[serde(default)]
    pub status: ReplyStatus,
    #[serde(default)]
    pub subshell_id: Vec<String>,
}

impl ListSubshellReply {
    pub const MSG_TYPE: &'static str = "list_subshell_reply";
}
