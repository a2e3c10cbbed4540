//! Per-request completion tracking and interception hooks.
//!
//! A [`ShellFuture`] correlates one outgoing shell request with its reply
//! and associated broadcast output. It is done once the shell reply and the
//! iopub `status: idle` for its msg_id have both arrived, in either order
//! (the reply half is waived for `expect_reply = false` sends).
//!
//! Each future carries a chain of interception hooks, most recently
//! registered first. Hooks are awaited one at a time; a hook resolving to
//! exactly `false` aborts the chain and suppresses the terminal callback
//! for that message. Hook outcomes never affect done resolution, which
//! depends only on the reply/idle pair.

use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::future::BoxFuture;
use log::{error, warn};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::KernelError;
use crate::messages::{ExecutionStatus, KernelMessage};
use crate::router::RouterTables;

/// An interceptor over inbound iopub/stdin messages.
///
/// Resolving to `Ok(false)` aborts processing of the current message for
/// the rest of the chain; any other value continues. Errors are reported
/// and treated as an abort.
pub type MessageHook =
    Arc<dyn Fn(&KernelMessage) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHook`].
pub fn async_hook<F, Fut>(f: F) -> MessageHook
where
    F: Fn(&KernelMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Wrap a synchronous closure as a [`MessageHook`].
pub fn sync_hook<F>(f: F) -> MessageHook
where
    F: Fn(&KernelMessage) -> bool + Send + Sync + 'static,
{
    Arc::new(move |msg| {
        let verdict = f(msg);
        Box::pin(async move { Ok(verdict) })
    })
}

pub(crate) type Callback = Box<dyn FnMut(&KernelMessage) + Send>;
type DoneCallback = Box<dyn FnOnce(Option<&KernelMessage>) + Send>;

/// Completion state published on the future's watch channel.
#[derive(Clone)]
pub(crate) enum DoneState {
    Pending,
    Done(Option<KernelMessage>),
    Disposed,
}

struct FutureState {
    /// Hook chain, most recently registered first.
    hooks: Vec<MessageHook>,
    on_reply: Option<Callback>,
    on_iopub: Option<Callback>,
    on_stdin: Option<Callback>,
    on_done: Option<DoneCallback>,
    reply: Option<KernelMessage>,
    reply_seen: bool,
    idle_seen: bool,
    done: bool,
    disposed: bool,
}

pub(crate) struct FutureShared {
    msg: KernelMessage,
    expect_reply: bool,
    dispose_on_done: bool,
    /// Back-reference for removing ourselves from the outstanding table.
    tables: Weak<StdMutex<RouterTables>>,
    state: StdMutex<FutureState>,
    done_tx: watch::Sender<DoneState>,
}

impl FutureShared {
    pub fn new(
        msg: KernelMessage,
        expect_reply: bool,
        dispose_on_done: bool,
        tables: Weak<StdMutex<RouterTables>>,
    ) -> Arc<Self> {
        let (done_tx, _) = watch::channel(DoneState::Pending);
        Arc::new(Self {
            msg,
            expect_reply,
            dispose_on_done,
            tables,
            state: StdMutex::new(FutureState {
                hooks: Vec::new(),
                on_reply: None,
                on_iopub: None,
                on_stdin: None,
                on_done: None,
                reply: None,
                reply_seen: false,
                idle_seen: false,
                done: false,
                disposed: false,
            }),
            done_tx,
        })
    }

    pub fn msg(&self) -> &KernelMessage {
        &self.msg
    }

    pub fn msg_id(&self) -> &str {
        self.msg.msg_id()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().disposed
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    pub fn register_hook(&self, hook: MessageHook) {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return;
        }
        if state.hooks.iter().any(|h| Arc::ptr_eq(h, &hook)) {
            warn!("[future] Hook already registered on {}", self.msg_id());
            return;
        }
        // Most recently registered runs first
        state.hooks.insert(0, hook);
    }

    pub fn remove_hook(&self, hook: &MessageHook) {
        let mut state = self.state.lock().unwrap();
        state.hooks.retain(|h| !Arc::ptr_eq(h, hook));
    }

    pub fn set_on_reply(&self, cb: Callback) {
        self.state.lock().unwrap().on_reply = Some(cb);
    }

    pub fn set_on_iopub(&self, cb: Callback) {
        self.state.lock().unwrap().on_iopub = Some(cb);
    }

    pub fn set_on_stdin(&self, cb: Callback) {
        self.state.lock().unwrap().on_stdin = Some(cb);
    }

    pub fn set_on_done(&self, cb: DoneCallback) {
        self.state.lock().unwrap().on_done = Some(cb);
    }

    /// Deliver the shell reply for this future's request.
    pub fn handle_reply(&self, msg: &KernelMessage) {
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed || state.reply_seen {
                return;
            }
            state.reply_seen = true;
            state.reply = Some(msg.clone());
        }
        self.invoke_callback(|s| &mut s.on_reply, msg);
        self.check_done();
    }

    /// Deliver an iopub message parented to this future's request.
    ///
    /// `suppressed` carries an abort verdict from the connection-level hook
    /// chain; the future's own hooks and callback are skipped but the
    /// reply/idle bookkeeping still happens.
    pub async fn handle_iopub(&self, msg: &KernelMessage, suppressed: bool) {
        let aborted = suppressed || self.run_hooks(msg).await;

        let is_idle = msg.execution_status() == Some(ExecutionStatus::Idle);
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            if is_idle {
                state.idle_seen = true;
            }
        }

        if !aborted {
            self.invoke_callback(|s| &mut s.on_iopub, msg);
        }
        self.check_done();
    }

    /// Deliver a stdin message parented to this future's request.
    pub async fn handle_stdin(&self, msg: &KernelMessage, suppressed: bool) {
        let aborted = suppressed || self.run_hooks(msg).await;
        if self.is_disposed() {
            return;
        }
        if !aborted {
            self.invoke_callback(|s| &mut s.on_stdin, msg);
        }
    }

    /// Run the hook chain for one message. Returns true if aborted.
    ///
    /// The chain is snapshotted up front, so a hook registered during
    /// dispatch only sees subsequent messages; before each invocation the
    /// live list is re-checked, so removal takes effect immediately.
    async fn run_hooks(&self, msg: &KernelMessage) -> bool {
        let snapshot: Vec<MessageHook> = self.state.lock().unwrap().hooks.clone();
        for hook in snapshot {
            let still_registered = {
                let state = self.state.lock().unwrap();
                !state.disposed && state.hooks.iter().any(|h| Arc::ptr_eq(h, &hook))
            };
            if !still_registered {
                continue;
            }
            match hook(msg).await {
                Ok(false) => return true,
                Ok(_) => {}
                Err(e) => {
                    error!(
                        "[future] Hook failed on {} for {}: {}",
                        self.msg_id(),
                        msg.msg_type(),
                        e
                    );
                    return true;
                }
            }
        }
        false
    }

    /// Invoke a stored callback outside the state lock.
    fn invoke_callback(
        &self,
        slot: fn(&mut FutureState) -> &mut Option<Callback>,
        msg: &KernelMessage,
    ) {
        let cb = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            slot(&mut state).take()
        };
        if let Some(mut cb) = cb {
            cb(msg);
            let mut state = self.state.lock().unwrap();
            // Keep the callback unless the future was disposed meanwhile or
            // the callback itself installed a replacement.
            if !state.disposed && slot(&mut state).is_none() {
                *slot(&mut state) = Some(cb);
            }
        }
    }

    /// Mark done if both halves have arrived; resolves the completion
    /// channel and, with `dispose_on_done`, disposes the future.
    fn check_done(&self) {
        let (reply, on_done) = {
            let mut state = self.state.lock().unwrap();
            if state.done || state.disposed {
                return;
            }
            if !(state.idle_seen && (state.reply_seen || !self.expect_reply)) {
                return;
            }
            state.done = true;
            (state.reply.clone(), state.on_done.take())
        };
        if let Some(cb) = on_done {
            cb(reply.as_ref());
        }
        self.done_tx.send_replace(DoneState::Done(reply));
        if self.dispose_on_done {
            self.dispose();
        }
    }

    /// Dispose the future: clear hooks and callbacks, remove it from the
    /// outstanding table, and abort any pending `done()` waiters. Disposal
    /// after done keeps the resolved completion value.
    pub fn dispose(&self) {
        let was_done = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.hooks.clear();
            state.on_reply = None;
            state.on_iopub = None;
            state.on_stdin = None;
            state.on_done = None;
            state.done
        };
        if !was_done {
            self.done_tx.send_replace(DoneState::Disposed);
        }
        if let Some(tables) = self.tables.upgrade() {
            tables.lock().unwrap().futures.remove(self.msg_id());
        }
    }

    pub fn subscribe_done(&self) -> watch::Receiver<DoneState> {
        self.done_tx.subscribe()
    }
}

/// Handle for one outstanding shell request.
#[derive(Clone)]
pub struct ShellFuture {
    pub(crate) shared: Arc<FutureShared>,
}

impl ShellFuture {
    pub(crate) fn new(shared: Arc<FutureShared>) -> Self {
        Self { shared }
    }

    /// The message that was sent.
    pub fn msg(&self) -> &KernelMessage {
        self.shared.msg()
    }

    pub fn msg_id(&self) -> &str {
        self.shared.msg_id()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Register a hook; the most recently registered hook runs first.
    pub fn register_message_hook(&self, hook: MessageHook) {
        self.shared.register_hook(hook);
    }

    /// Remove a hook by identity; effective immediately for messages not
    /// yet dispatched to it.
    pub fn remove_message_hook(&self, hook: &MessageHook) {
        self.shared.remove_hook(hook);
    }

    /// Set the shell reply callback.
    pub fn on_reply(&self, cb: impl FnMut(&KernelMessage) + Send + 'static) {
        self.shared.set_on_reply(Box::new(cb));
    }

    /// Set the iopub callback, invoked after the hook chain allows a message.
    pub fn on_iopub(&self, cb: impl FnMut(&KernelMessage) + Send + 'static) {
        self.shared.set_on_iopub(Box::new(cb));
    }

    /// Set the stdin callback.
    pub fn on_stdin(&self, cb: impl FnMut(&KernelMessage) + Send + 'static) {
        self.shared.set_on_stdin(Box::new(cb));
    }

    /// Set the completion callback, invoked once with the reply (if any)
    /// just before `done()` resolves.
    pub fn on_done(&self, cb: impl FnOnce(Option<&KernelMessage>) + Send + 'static) {
        self.shared.set_on_done(Box::new(cb));
    }

    /// Wait for completion: resolves with the reply message once both the
    /// reply and the idle status have arrived, or with `None` when no reply
    /// was expected. Fails with [`KernelError::FutureDisposed`] if the
    /// future is disposed first.
    pub async fn done(&self) -> Result<Option<KernelMessage>, KernelError> {
        let mut rx = self.shared.subscribe_done();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    DoneState::Done(reply) => return Ok(reply.clone()),
                    DoneState::Disposed => return Err(KernelError::FutureDisposed),
                    DoneState::Pending => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(KernelError::FutureDisposed);
            }
        }
    }

    /// Wait for completion and decode the reply content.
    ///
    /// Fails with [`KernelError::ReplyError`] when the kernel reported
    /// `status: error` (or aborted the request).
    pub async fn reply_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, KernelError> {
        let reply = self.done().await?.ok_or(KernelError::NoReply)?;
        let content = &reply.content;
        match content.get("status").and_then(Value::as_str) {
            Some("error") => {
                return Err(KernelError::ReplyError {
                    ename: content
                        .get("ename")
                        .and_then(Value::as_str)
                        .unwrap_or("Error")
                        .to_string(),
                    evalue: content
                        .get("evalue")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            }
            Some("aborted") | Some("abort") => {
                return Err(KernelError::ReplyError {
                    ename: "aborted".to_string(),
                    evalue: "request was aborted by the kernel".to_string(),
                })
            }
            _ => {}
        }
        Ok(reply.parsed_content()?)
    }

    /// Dispose the future, aborting any `done()` waiters.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}
