//! Inbound message dispatch.
//!
//! A single router task per connection drains the inbound queue and routes
//! each message in arrival order: shell replies to the matching future,
//! iopub/stdin traffic through the connection-level hook table and the
//! owning future's hook chain, comm-family messages to the addressed comm,
//! and everything unclaimed (other than kernel-wide status updates) to the
//! unhandled-message signal.
//!
//! Each message's hook chain is fully awaited before the next message is
//! processed, so hooks and callbacks always observe messages in arrival
//! order even when individual hooks are asynchronous.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use tokio::sync::mpsc;

use crate::comm::{Comm, CommShared};
use crate::connection::ConnectionInner;
use crate::future::{FutureShared, MessageHook};
use crate::messages::{
    Channel, CommClose, CommMsg, CommOpen, KernelInfoReply, KernelMessage, Status,
};

/// Handler invoked when an inbound `comm_open` names a registered target.
pub type CommTargetHandler = Arc<dyn Fn(Comm, &KernelMessage) + Send + Sync>;

/// Tables of outstanding work owned by the connection.
pub(crate) struct RouterTables {
    /// Outstanding request msg_id -> future.
    pub futures: HashMap<String, Arc<FutureShared>>,
    /// comm id -> comm.
    pub comms: HashMap<String, Arc<CommShared>>,
    /// target name -> comm_open handler (last registration wins).
    pub targets: HashMap<String, CommTargetHandler>,
    /// Connection-level hooks keyed by parent msg_id, newest first.
    pub hooks: HashMap<String, Vec<MessageHook>>,
}

impl RouterTables {
    pub fn new() -> Self {
        Self {
            futures: HashMap::new(),
            comms: HashMap::new(),
            targets: HashMap::new(),
            hooks: HashMap::new(),
        }
    }
}

/// Spawn the dispatch loop. The task holds only a weak reference so the
/// connection can drop while messages are still queued.
pub(crate) fn spawn_router(
    inner: &Arc<ConnectionInner>,
    mut rx: mpsc::UnboundedReceiver<KernelMessage>,
) {
    let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            if inner.disposed.load(Ordering::SeqCst) {
                break;
            }
            route_message(&inner, &msg).await;
        }
        debug!("[router] Dispatch loop ended");
    });
}

/// Route one inbound message according to its channel.
pub(crate) async fn route_message(inner: &Arc<ConnectionInner>, msg: &KernelMessage) {
    match msg.channel {
        Channel::Shell | Channel::Control => route_shell(inner, msg),
        Channel::IOPub => route_iopub(inner, msg).await,
        Channel::Stdin => route_stdin(inner, msg).await,
    }
}

/// Shell replies correlate by the msg_id of the request they answer.
fn route_shell(inner: &Arc<ConnectionInner>, msg: &KernelMessage) {
    if msg.msg_type() == KernelInfoReply::MSG_TYPE {
        match msg.parsed_content::<KernelInfoReply>() {
            Ok(info) => inner.cache_kernel_info(info),
            Err(e) => warn!("[router] Unparseable kernel_info_reply: {}", e),
        }
    }

    let future = msg.parent_msg_id().and_then(|parent| {
        inner.tables.lock().unwrap().futures.get(parent).cloned()
    });
    match future {
        Some(future) => future.handle_reply(msg),
        None => {
            debug!(
                "[router] Unclaimed shell reply: type={} parent={:?}",
                msg.msg_type(),
                msg.parent_msg_id()
            );
            let _ = inner.unhandled_tx.send(msg.clone());
        }
    }
}

async fn route_iopub(inner: &Arc<ConnectionInner>, msg: &KernelMessage) {
    let parent_id = msg.parent_msg_id().map(str::to_string);
    let mut claimed = false;

    // Connection-level hooks first; an abort suppresses the future's own
    // chain and callbacks for this message but nothing else.
    let mut suppressed = false;
    if let Some(parent) = &parent_id {
        let snapshot = {
            let tables = inner.tables.lock().unwrap();
            tables.hooks.get(parent).cloned().unwrap_or_default()
        };
        if !snapshot.is_empty() {
            claimed = true;
            suppressed = run_connection_hooks(inner, parent, snapshot, msg).await;
        }
    }

    let future = parent_id
        .as_ref()
        .and_then(|parent| inner.tables.lock().unwrap().futures.get(parent).cloned());
    if let Some(future) = future {
        claimed = true;
        future.handle_iopub(msg, suppressed).await;
    }

    // Kernel-wide status updates happen regardless of hooks and claims
    let is_status = msg.msg_type() == Status::MSG_TYPE;
    if let Some(status) = msg.execution_status() {
        inner.set_status(status);
    }

    // Comm-family routing is likewise independent of hook outcomes
    claimed |= match msg.msg_type() {
        CommOpen::MSG_TYPE => handle_comm_open(inner, msg),
        CommMsg::MSG_TYPE => handle_comm_msg(inner, msg),
        CommClose::MSG_TYPE => handle_comm_close(inner, msg),
        _ => false,
    };

    if !claimed && !is_status {
        debug!("[router] Unhandled iopub message: {}", msg.msg_type());
        let _ = inner.unhandled_tx.send(msg.clone());
    }
}

async fn route_stdin(inner: &Arc<ConnectionInner>, msg: &KernelMessage) {
    let parent_id = msg.parent_msg_id().map(str::to_string);

    let mut suppressed = false;
    if let Some(parent) = &parent_id {
        let snapshot = {
            let tables = inner.tables.lock().unwrap();
            tables.hooks.get(parent).cloned().unwrap_or_default()
        };
        suppressed = run_connection_hooks(inner, parent, snapshot, msg).await;
    }

    let future = parent_id
        .as_ref()
        .and_then(|parent| inner.tables.lock().unwrap().futures.get(parent).cloned());
    if let Some(future) = future {
        future.handle_stdin(msg, suppressed).await;
    }

    // A caller holding no reference to the future can still answer
    let _ = inner.pending_input_tx.send(msg.clone());
}

/// Run the connection-level hook chain for one message.
///
/// Same contract as the future-level chain: sequential, newest first,
/// snapshot up front, membership re-checked before each invocation so
/// removal is immediate and additions only see later messages. Returns
/// true if a hook aborted.
async fn run_connection_hooks(
    inner: &Arc<ConnectionInner>,
    parent: &str,
    snapshot: Vec<MessageHook>,
    msg: &KernelMessage,
) -> bool {
    for hook in snapshot {
        let still_registered = {
            let tables = inner.tables.lock().unwrap();
            tables
                .hooks
                .get(parent)
                .is_some_and(|hooks| hooks.iter().any(|h| Arc::ptr_eq(h, &hook)))
        };
        if !still_registered {
            continue;
        }
        match hook(msg).await {
            Ok(false) => return true,
            Ok(_) => {}
            Err(e) => {
                error!(
                    "[router] Connection hook failed for parent {}: {}",
                    parent, e
                );
                return true;
            }
        }
    }
    false
}

/// Accept-side comm creation: a registered target handler claims the open.
fn handle_comm_open(inner: &Arc<ConnectionInner>, msg: &KernelMessage) -> bool {
    let open: CommOpen = match msg.parsed_content() {
        Ok(open) => open,
        Err(e) => {
            warn!("[router] Malformed comm_open: {}", e);
            return false;
        }
    };
    let handler = {
        let tables = inner.tables.lock().unwrap();
        tables.targets.get(&open.target_name).cloned()
    };
    let Some(handler) = handler else {
        debug!(
            "[router] No handler for comm target '{}' (comm {})",
            open.target_name, open.comm_id
        );
        return false;
    };

    let shared = CommShared::new(
        open.comm_id.clone(),
        open.target_name.clone(),
        Arc::downgrade(inner),
    );
    {
        let mut tables = inner.tables.lock().unwrap();
        if tables
            .comms
            .insert(open.comm_id.clone(), shared.clone())
            .is_some()
        {
            warn!("[router] comm_open replaced existing comm {}", open.comm_id);
        }
    }
    handler(Comm::new(shared), msg);
    true
}

fn handle_comm_msg(inner: &Arc<ConnectionInner>, msg: &KernelMessage) -> bool {
    let content: CommMsg = match msg.parsed_content() {
        Ok(content) => content,
        Err(e) => {
            warn!("[router] Malformed comm_msg: {}", e);
            return false;
        }
    };
    let comm = {
        let tables = inner.tables.lock().unwrap();
        tables.comms.get(&content.comm_id).cloned()
    };
    match comm {
        Some(comm) => {
            comm.handle_msg(msg);
            true
        }
        None => false,
    }
}

fn handle_comm_close(inner: &Arc<ConnectionInner>, msg: &KernelMessage) -> bool {
    let content: CommClose = match msg.parsed_content() {
        Ok(content) => content,
        Err(e) => {
            warn!("[router] Malformed comm_close: {}", e);
            return false;
        }
    };
    let comm = {
        let mut tables = inner.tables.lock().unwrap();
        tables.comms.remove(&content.comm_id)
    };
    match comm {
        Some(comm) => {
            comm.handle_close(msg);
            true
        }
        None => false,
    }
}
