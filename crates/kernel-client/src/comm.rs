//! Bidirectional comm sub-channels multiplexed over shell/iopub.
//!
//! A comm is one end of a named sub-channel identified by a comm id. Comms
//! are created either locally (open side, via
//! `KernelConnection::create_comm`) or upon receipt of a `comm_open`
//! addressed to a registered target (accept side). After `close`, sends
//! fail fast with [`KernelError::CommClosed`] rather than silently drop.

use std::sync::{Arc, Mutex as StdMutex, Weak};

use bytes::Bytes;
use log::debug;
use serde_json::Value;

use crate::connection::ConnectionInner;
use crate::error::KernelError;
use crate::future::{Callback, ShellFuture};
use crate::messages::{Channel, CommClose, CommMsg, CommOpen, KernelMessage};

struct CommState {
    on_msg: Option<Callback>,
    on_close: Option<Callback>,
    closed: bool,
}

pub(crate) struct CommShared {
    comm_id: String,
    target_name: String,
    conn: Weak<ConnectionInner>,
    state: StdMutex<CommState>,
}

impl CommShared {
    pub fn new(comm_id: String, target_name: String, conn: Weak<ConnectionInner>) -> Arc<Self> {
        Arc::new(Self {
            comm_id,
            target_name,
            conn,
            state: StdMutex::new(CommState {
                on_msg: None,
                on_close: None,
                closed: false,
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Deliver an inbound `comm_msg` for this comm.
    pub fn handle_msg(&self, msg: &KernelMessage) {
        self.invoke(|s| &mut s.on_msg, msg);
    }

    /// Deliver an inbound `comm_close`: mark closed, then notify.
    pub fn handle_close(&self, msg: &KernelMessage) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.invoke(|s| &mut s.on_close, msg);
        self.clear_callbacks();
    }

    /// Dispose without a wire message (restart/shutdown turnover).
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.clear_callbacks();
        if let Some(conn) = self.conn.upgrade() {
            conn.remove_comm(&self.comm_id);
        }
    }

    fn clear_callbacks(&self) {
        let mut state = self.state.lock().unwrap();
        state.on_msg = None;
        state.on_close = None;
    }

    fn invoke(&self, slot: fn(&mut CommState) -> &mut Option<Callback>, msg: &KernelMessage) {
        let cb = {
            let mut state = self.state.lock().unwrap();
            slot(&mut state).take()
        };
        if let Some(mut cb) = cb {
            cb(msg);
            let mut state = self.state.lock().unwrap();
            if slot(&mut state).is_none() {
                *slot(&mut state) = Some(cb);
            }
        }
    }
}

/// One end of a bidirectional named sub-channel.
#[derive(Clone)]
pub struct Comm {
    pub(crate) shared: Arc<CommShared>,
}

impl Comm {
    pub(crate) fn new(shared: Arc<CommShared>) -> Self {
        Self { shared }
    }

    pub fn comm_id(&self) -> &str {
        &self.shared.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.shared.target_name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closed and disposed are the same terminal state for a comm.
    pub fn is_disposed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Set the callback for inbound `comm_msg` messages.
    pub fn on_msg(&self, cb: impl FnMut(&KernelMessage) + Send + 'static) {
        self.shared.state.lock().unwrap().on_msg = Some(Box::new(cb));
    }

    /// Set the callback for `comm_close`, local or remote.
    pub fn on_close(&self, cb: impl FnMut(&KernelMessage) + Send + 'static) {
        self.shared.state.lock().unwrap().on_close = Some(Box::new(cb));
    }

    /// Send `comm_open` to the peer, announcing this comm.
    pub fn open(
        &self,
        data: Value,
        metadata: Value,
        buffers: Vec<Bytes>,
    ) -> Result<ShellFuture, KernelError> {
        let content = serde_json::to_value(CommOpen {
            comm_id: self.shared.comm_id.clone(),
            target_name: self.shared.target_name.clone(),
            data,
        })?;
        self.send_comm(CommOpen::MSG_TYPE, content, metadata, buffers)
    }

    /// Send `comm_msg`. Fails fast once the comm is closed.
    pub fn send(
        &self,
        data: Value,
        metadata: Value,
        buffers: Vec<Bytes>,
    ) -> Result<ShellFuture, KernelError> {
        let content = serde_json::to_value(CommMsg {
            comm_id: self.shared.comm_id.clone(),
            data,
        })?;
        self.send_comm(CommMsg::MSG_TYPE, content, metadata, buffers)
    }

    /// Send `comm_close`, mark this end closed, and invoke `on_close`.
    pub fn close(
        &self,
        data: Value,
        metadata: Value,
        buffers: Vec<Bytes>,
    ) -> Result<ShellFuture, KernelError> {
        let content = serde_json::to_value(CommClose {
            comm_id: self.shared.comm_id.clone(),
            data,
        })?;
        let future = self.send_comm(CommClose::MSG_TYPE, content, metadata, buffers)?;

        debug!("[comm] Closed comm {}", self.shared.comm_id);
        self.shared.handle_close(future.msg());
        if let Some(conn) = self.shared.conn.upgrade() {
            conn.remove_comm(&self.shared.comm_id);
        }
        Ok(future)
    }

    fn send_comm(
        &self,
        msg_type: &str,
        content: Value,
        metadata: Value,
        buffers: Vec<Bytes>,
    ) -> Result<ShellFuture, KernelError> {
        if self.is_closed() {
            return Err(KernelError::CommClosed);
        }
        let conn = self
            .shared
            .conn
            .upgrade()
            .ok_or(KernelError::ConnectionDisposed)?;
        let mut msg = conn.build_message(msg_type, Channel::Shell, content);
        msg.metadata = metadata;
        let msg = msg.with_buffers(buffers);
        let shared = conn.send_owned(msg, false, true)?;
        Ok(ShellFuture::new(shared))
    }
}
