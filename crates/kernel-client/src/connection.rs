//! Kernel connection: socket ownership, status state machines, and the
//! public request/response API.
//!
//! A [`KernelConnection`] owns one WebSocket to a remote kernel, shared by
//! every future and comm it creates. Outbound requests are registered in
//! the outstanding table before their frame is queued, so an immediately
//! arriving reply can never race its future. Inbound frames are stamped
//! onto the `any_message` signal synchronously on arrival, then queued for
//! sequential routing (see `router`).
//!
//! Kernel execution status and transport status are independent state
//! machines: socket loss maps to `unknown` (recoverable by reconnection)
//! while an explicit death signal maps to the sticky terminal `dead`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use uuid::Uuid;

use crate::comm::{Comm, CommShared};
use crate::error::KernelError;
use crate::future::{FutureShared, MessageHook, ShellFuture};
use crate::messages::{
    Channel, CommInfoRequest, CompleteRequest, ConnectionStatus, CreateSubshellRequest,
    DeleteSubshellRequest, ExecuteRequest, ExecutionStatus, Header, HistoryRequest, InputReply,
    InspectRequest, IsCompleteRequest, KernelInfoReply, KernelInfoRequest, KernelMessage,
    ListSubshellRequest,
};
use crate::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::rest::{KernelApiClient, KernelModel, ServerSettings};
use crate::router::{self, CommTargetHandler, RouterTables};
use crate::serializer::{serializer_for, MessageSerializer, WireFrame, V1_PROTOCOL};

/// Direction tag for the `any_message` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Send,
    Recv,
}

/// One entry on the `any_message` diagnostics signal.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub direction: MessageDirection,
    pub msg: KernelMessage,
}

/// Options for establishing a kernel connection.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Username stamped into outgoing message headers.
    pub username: String,
    /// Client session id; generated when not provided.
    pub client_id: Option<String>,
    /// Whether this connection routes comm messages. Secondary connections
    /// to the same kernel should disable this so each comm_open is handled
    /// exactly once.
    pub handle_comms: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            username: String::new(),
            client_id: None,
            handle_comms: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

pub(crate) enum SocketCommand {
    Reconnect,
    Shutdown,
}

pub(crate) struct ConnectionInner {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) client_id: String,
    pub(crate) username: String,
    pub(crate) handle_comms: bool,
    pub(crate) settings: ServerSettings,
    pub(crate) api: KernelApiClient,
    pub(crate) tables: Arc<StdMutex<RouterTables>>,
    pub(crate) status_tx: watch::Sender<ExecutionStatus>,
    pub(crate) conn_status_tx: watch::Sender<ConnectionStatus>,
    pub(crate) any_message_tx: broadcast::Sender<MessageEvent>,
    pub(crate) unhandled_tx: broadcast::Sender<KernelMessage>,
    pub(crate) pending_input_tx: broadcast::Sender<KernelMessage>,
    pub(crate) outbound_tx: mpsc::UnboundedSender<KernelMessage>,
    pub(crate) router_tx: mpsc::UnboundedSender<KernelMessage>,
    pub(crate) socket_cmd_tx: mpsc::UnboundedSender<SocketCommand>,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) reconnect_exhausted: AtomicBool,
    pub(crate) live_handles: AtomicUsize,
    pub(crate) disposed: AtomicBool,
    kernel_info: StdMutex<Option<KernelInfoReply>>,
}

impl ConnectionInner {
    pub(crate) fn status(&self) -> ExecutionStatus {
        *self.status_tx.borrow()
    }

    pub(crate) fn connection_status(&self) -> ConnectionStatus {
        *self.conn_status_tx.borrow()
    }

    /// Update kernel execution status. `dead` is sticky.
    pub(crate) fn set_status(&self, status: ExecutionStatus) {
        let current = self.status();
        if current == status {
            return;
        }
        if current == ExecutionStatus::Dead {
            return;
        }
        info!(
            "[kernel-connection] {} status: {} -> {}",
            self.id, current, status
        );
        self.status_tx.send_replace(status);
    }

    pub(crate) fn set_connection_status(&self, status: ConnectionStatus) {
        let current = self.connection_status();
        if current == status {
            return;
        }
        info!(
            "[kernel-connection] {} transport: {} -> {}",
            self.id, current, status
        );
        self.conn_status_tx.send_replace(status);
    }

    pub(crate) fn emit_any(&self, direction: MessageDirection, msg: &KernelMessage) {
        let _ = self.any_message_tx.send(MessageEvent {
            direction,
            msg: msg.clone(),
        });
    }

    pub(crate) fn build_message(&self, msg_type: &str, channel: Channel, content: Value) -> KernelMessage {
        KernelMessage::new(msg_type, channel, content, &self.client_id, &self.username)
    }

    /// Register a future and queue its message for send.
    ///
    /// The registration happens before the frame leaves, so a reply cannot
    /// race the outstanding table. Fails synchronously once the kernel is
    /// dead or the connection is disposed.
    pub(crate) fn send_owned(
        &self,
        msg: KernelMessage,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<Arc<FutureShared>, KernelError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(KernelError::ConnectionDisposed);
        }
        if !self.status().can_send() {
            return Err(KernelError::Dead);
        }
        let shared = FutureShared::new(
            msg.clone(),
            expect_reply,
            dispose_on_done,
            Arc::downgrade(&self.tables),
        );
        self.tables
            .lock()
            .unwrap()
            .futures
            .insert(msg.msg_id().to_string(), shared.clone());
        self.emit_any(MessageDirection::Send, &msg);
        let _ = self.outbound_tx.send(msg);
        Ok(shared)
    }

    /// Queue a message with no future (input replies).
    pub(crate) fn send_plain(&self, msg: KernelMessage) -> Result<(), KernelError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(KernelError::ConnectionDisposed);
        }
        if !self.status().can_send() {
            return Err(KernelError::Dead);
        }
        self.emit_any(MessageDirection::Send, &msg);
        let _ = self.outbound_tx.send(msg);
        Ok(())
    }

    pub(crate) fn cache_kernel_info(&self, info: KernelInfoReply) {
        *self.kernel_info.lock().unwrap() = Some(info);
    }

    pub(crate) fn remove_comm(&self, comm_id: &str) {
        self.tables.lock().unwrap().comms.remove(comm_id);
    }

    /// Dispose every outstanding future and comm (restart/shutdown
    /// turnover). In-flight replies for the old generation will find no
    /// future and surface as unhandled.
    pub(crate) fn invalidate_generation(&self) {
        let (futures, comms) = {
            let mut tables = self.tables.lock().unwrap();
            (
                std::mem::take(&mut tables.futures),
                std::mem::take(&mut tables.comms),
            )
        };
        info!(
            "[kernel-connection] {} invalidating {} futures, {} comms",
            self.id,
            futures.len(),
            comms.len()
        );
        for future in futures.values() {
            future.dispose();
        }
        for comm in comms.values() {
            comm.dispose();
        }
    }

    /// Connection-wide teardown: dispose outstanding work and close the
    /// socket. Allowed from any connection status.
    pub(crate) fn dispose_all(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[kernel-connection] {} disposed", self.id);
        self.invalidate_generation();
        {
            let mut tables = self.tables.lock().unwrap();
            tables.targets.clear();
            tables.hooks.clear();
        }
        let _ = self.socket_cmd_tx.send(SocketCommand::Shutdown);
        self.set_connection_status(ConnectionStatus::Disconnected);
    }

    fn ws_endpoint(&self) -> String {
        let mut url = format!(
            "{}/api/kernels/{}/channels?session_id={}",
            self.settings.ws_url, self.id, self.client_id
        );
        if let Some(token) = &self.settings.token {
            url.push_str("&token=");
            url.push_str(token);
        }
        url
    }
}

/// Handle to a live kernel connection.
///
/// Handles are reference-counted over one shared socket and outstanding
/// table: `clone` produces a second independently disposable handle, and
/// the socket is torn down when the last live handle is disposed.
pub struct KernelConnection {
    pub(crate) inner: Arc<ConnectionInner>,
    handle_disposed: AtomicBool,
}

impl Clone for KernelConnection {
    fn clone(&self) -> Self {
        self.inner.live_handles.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: self.inner.clone(),
            handle_disposed: AtomicBool::new(false),
        }
    }
}

impl KernelConnection {
    /// Connect to a running kernel.
    pub async fn connect(
        settings: ServerSettings,
        model: KernelModel,
        options: ConnectOptions,
    ) -> Result<Self, KernelError> {
        let (conn, outbound_rx, cmd_rx) = Self::build(settings, model, options);
        spawn_socket_task(Arc::downgrade(&conn.inner), outbound_rx, cmd_rx);
        conn.wait_for_connected().await?;
        Ok(conn)
    }

    /// Start a new kernel via the lifecycle API, then connect to it.
    pub async fn start(
        settings: ServerSettings,
        kernel_name: &str,
        options: ConnectOptions,
    ) -> Result<Self, KernelError> {
        let api = KernelApiClient::new(settings.clone());
        let model = api.start_kernel(kernel_name).await?;
        Self::connect(settings, model, options).await
    }

    /// Look up a kernel by id via the lifecycle API, then connect to it.
    pub async fn attach(
        settings: ServerSettings,
        kernel_id: &str,
        options: ConnectOptions,
    ) -> Result<Self, KernelError> {
        let api = KernelApiClient::new(settings.clone());
        let model = api.get_kernel(kernel_id).await?;
        Self::connect(settings, model, options).await
    }

    fn build(
        settings: ServerSettings,
        model: KernelModel,
        options: ConnectOptions,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<KernelMessage>,
        mpsc::UnboundedReceiver<SocketCommand>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (socket_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ExecutionStatus::Unknown);
        let (conn_status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        let (any_message_tx, _) = broadcast::channel(256);
        let (unhandled_tx, _) = broadcast::channel(64);
        let (pending_input_tx, _) = broadcast::channel(16);

        let inner = Arc::new(ConnectionInner {
            id: model.id,
            name: model.name,
            client_id: options
                .client_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            username: options.username,
            handle_comms: options.handle_comms,
            api: KernelApiClient::new(settings.clone()),
            settings,
            tables: Arc::new(StdMutex::new(RouterTables::new())),
            status_tx,
            conn_status_tx,
            any_message_tx,
            unhandled_tx,
            pending_input_tx,
            outbound_tx,
            router_tx,
            socket_cmd_tx,
            reconnect: options.reconnect,
            reconnect_exhausted: AtomicBool::new(false),
            live_handles: AtomicUsize::new(1),
            disposed: AtomicBool::new(false),
            kernel_info: StdMutex::new(None),
        });
        router::spawn_router(&inner, router_rx);

        (
            Self {
                inner,
                handle_disposed: AtomicBool::new(false),
            },
            outbound_rx,
            cmd_rx,
        )
    }

    /// Build a connection with no socket task, for in-process tests. The
    /// returned receiver observes everything that would have hit the wire.
    #[cfg(test)]
    pub(crate) fn new_detached(
        settings: ServerSettings,
        model: KernelModel,
        options: ConnectOptions,
    ) -> (Self, mpsc::UnboundedReceiver<KernelMessage>) {
        let (conn, outbound_rx, _cmd_rx) = Self::build(settings, model, options);
        conn.inner.set_connection_status(ConnectionStatus::Connected);
        (conn, outbound_rx)
    }

    // ------------------------------------------------------------------
    // Identity and state
    // ------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn status(&self) -> ExecutionStatus {
        self.inner.status()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection_status()
    }

    /// The most recent cached `kernel_info_reply`, if any has arrived.
    pub fn kernel_info(&self) -> Option<KernelInfoReply> {
        self.inner.kernel_info.lock().unwrap().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ExecutionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.conn_status_tx.subscribe()
    }

    /// Every message, sent and received, tagged with direction. Emitted
    /// synchronously in arrival order, ahead of routing.
    pub fn subscribe_any_message(&self) -> broadcast::Receiver<MessageEvent> {
        self.inner.any_message_tx.subscribe()
    }

    /// Messages no future, hook, or comm claimed.
    pub fn subscribe_unhandled(&self) -> broadcast::Receiver<KernelMessage> {
        self.inner.unhandled_tx.subscribe()
    }

    /// Kernel-side input requests (stdin channel), for callers that hold
    /// no reference to the originating future.
    pub fn subscribe_pending_input(&self) -> broadcast::Receiver<KernelMessage> {
        self.inner.pending_input_tx.subscribe()
    }

    /// Mark the kernel dead: terminal, no further sends are accepted.
    pub fn mark_dead(&self) {
        self.inner.status_tx.send_replace(ExecutionStatus::Dead);
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Send a shell message and return its future.
    ///
    /// Fails fast with [`KernelError::Dead`] once the kernel is dead. The
    /// future is registered before the frame is queued, so an immediately
    /// arriving reply finds it.
    pub fn send_shell_message(
        &self,
        msg: KernelMessage,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<ShellFuture, KernelError> {
        self.ensure_live()?;
        let shared = self.inner.send_owned(msg, expect_reply, dispose_on_done)?;
        Ok(ShellFuture::new(shared))
    }

    fn request<T: serde::Serialize>(
        &self,
        msg_type: &str,
        content: &T,
        dispose_on_done: bool,
    ) -> Result<ShellFuture, KernelError> {
        let msg = self
            .inner
            .build_message(msg_type, Channel::Shell, serde_json::to_value(content)?);
        self.send_shell_message(msg, true, dispose_on_done)
    }

    /// Execute code. Pass `dispose_on_done = false` to keep the future
    /// addressable after completion (e.g. for deferred hook registration).
    pub fn request_execute(
        &self,
        content: ExecuteRequest,
        dispose_on_done: bool,
    ) -> Result<ShellFuture, KernelError> {
        self.request(ExecuteRequest::MSG_TYPE, &content, dispose_on_done)
    }

    pub fn request_kernel_info(&self) -> Result<ShellFuture, KernelError> {
        self.request(KernelInfoRequest::MSG_TYPE, &KernelInfoRequest::default(), true)
    }

    pub fn request_complete(&self, content: CompleteRequest) -> Result<ShellFuture, KernelError> {
        self.request(CompleteRequest::MSG_TYPE, &content, true)
    }

    pub fn request_inspect(&self, content: InspectRequest) -> Result<ShellFuture, KernelError> {
        self.request(InspectRequest::MSG_TYPE, &content, true)
    }

    pub fn request_is_complete(
        &self,
        content: IsCompleteRequest,
    ) -> Result<ShellFuture, KernelError> {
        self.request(IsCompleteRequest::MSG_TYPE, &content, true)
    }

    pub fn request_history(&self, content: HistoryRequest) -> Result<ShellFuture, KernelError> {
        self.request(HistoryRequest::MSG_TYPE, &content, true)
    }

    pub fn request_comm_info(&self, target_name: Option<String>) -> Result<ShellFuture, KernelError> {
        self.request(
            CommInfoRequest::MSG_TYPE,
            &CommInfoRequest { target_name },
            true,
        )
    }

    pub fn request_create_subshell(&self) -> Result<ShellFuture, KernelError> {
        self.request(
            CreateSubshellRequest::MSG_TYPE,
            &CreateSubshellRequest::default(),
            true,
        )
    }

    pub fn request_delete_subshell(&self, subshell_id: String) -> Result<ShellFuture, KernelError> {
        self.request(
            DeleteSubshellRequest::MSG_TYPE,
            &DeleteSubshellRequest { subshell_id },
            true,
        )
    }

    pub fn request_list_subshell(&self) -> Result<ShellFuture, KernelError> {
        self.request(
            ListSubshellRequest::MSG_TYPE,
            &ListSubshellRequest::default(),
            true,
        )
    }

    /// Answer a kernel-side input request on the stdin channel.
    pub fn send_input_reply(
        &self,
        content: InputReply,
        parent: Header,
    ) -> Result<(), KernelError> {
        self.ensure_live()?;
        let mut msg = self.inner.build_message(
            InputReply::MSG_TYPE,
            Channel::Stdin,
            serde_json::to_value(&content)?,
        );
        msg.set_parent(parent);
        self.inner.send_plain(msg)
    }

    // ------------------------------------------------------------------
    // Connection-level message hooks
    // ------------------------------------------------------------------

    /// Attach a hook to all iopub/stdin traffic parented to `msg_id`,
    /// independent of any future. Newest hooks run first.
    pub fn register_message_hook(&self, msg_id: &str, hook: MessageHook) {
        let mut tables = self.inner.tables.lock().unwrap();
        let hooks = tables.hooks.entry(msg_id.to_string()).or_default();
        if hooks.iter().any(|h| Arc::ptr_eq(h, &hook)) {
            warn!(
                "[kernel-connection] Hook already registered for {}",
                msg_id
            );
            return;
        }
        hooks.insert(0, hook);
    }

    /// Remove a hook by identity; effective immediately, even for a
    /// message currently mid-chain.
    pub fn remove_message_hook(&self, msg_id: &str, hook: &MessageHook) {
        let mut tables = self.inner.tables.lock().unwrap();
        if let Some(hooks) = tables.hooks.get_mut(msg_id) {
            hooks.retain(|h| !Arc::ptr_eq(h, hook));
            if hooks.is_empty() {
                tables.hooks.remove(msg_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Comms
    // ------------------------------------------------------------------

    /// Register the handler invoked when an inbound `comm_open` names
    /// `target_name`. At most one handler per name; the last registration
    /// wins.
    pub fn register_comm_target(
        &self,
        target_name: &str,
        handler: impl Fn(Comm, &KernelMessage) + Send + Sync + 'static,
    ) {
        let handler: CommTargetHandler = Arc::new(handler);
        self.inner
            .tables
            .lock()
            .unwrap()
            .targets
            .insert(target_name.to_string(), handler);
    }

    pub fn remove_comm_target(&self, target_name: &str) {
        self.inner.tables.lock().unwrap().targets.remove(target_name);
    }

    /// Create the local end of a comm. The caller announces it with
    /// [`Comm::open`].
    pub fn create_comm(
        &self,
        target_name: &str,
        comm_id: Option<String>,
    ) -> Result<Comm, KernelError> {
        self.ensure_live()?;
        if !self.inner.handle_comms {
            return Err(KernelError::CommsNotSupported);
        }
        let comm_id = comm_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let shared = CommShared::new(
            comm_id.clone(),
            target_name.to_string(),
            Arc::downgrade(&self.inner),
        );
        {
            let mut tables = self.inner.tables.lock().unwrap();
            if tables.comms.contains_key(&comm_id) {
                return Err(KernelError::DuplicateComm(comm_id));
            }
            tables.comms.insert(comm_id, shared.clone());
        }
        Ok(Comm::new(shared))
    }

    pub fn has_comm(&self, comm_id: &str) -> bool {
        self.inner.tables.lock().unwrap().comms.contains_key(comm_id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Interrupt the kernel via the lifecycle API.
    pub async fn interrupt(&self) -> Result<(), KernelError> {
        self.ensure_live()?;
        if !self.status().can_send() {
            return Err(KernelError::Dead);
        }
        self.inner.api.interrupt(&self.inner.id).await?;
        Ok(())
    }

    /// Restart the kernel via the lifecycle API.
    ///
    /// On success every outstanding future and comm is disposed: they are
    /// stale against the new kernel instance. The connection itself stays
    /// attached and usable.
    pub async fn restart(&self) -> Result<(), KernelError> {
        self.ensure_live()?;
        self.inner.api.restart(&self.inner.id).await?;
        self.inner.invalidate_generation();
        self.inner.set_status(ExecutionStatus::Restarting);
        Ok(())
    }

    /// Shut the kernel down via the lifecycle API and dispose the
    /// connection. A 404 means the kernel was already gone and counts as
    /// success.
    pub async fn shutdown(&self) -> Result<(), KernelError> {
        self.ensure_live()?;
        self.inner.api.shutdown(&self.inner.id).await?;
        self.mark_dead();
        self.inner.dispose_all();
        Ok(())
    }

    /// Close the current socket (if any) and open a new one, driving the
    /// transport through `connecting -> connected`. Fails if the
    /// connection was disposed mid-flight.
    pub async fn reconnect(&self) -> Result<(), KernelError> {
        self.ensure_live()?;
        self.inner.reconnect_exhausted.store(false, Ordering::SeqCst);
        let _ = self.inner.socket_cmd_tx.send(SocketCommand::Reconnect);
        self.wait_for_connected().await
    }

    async fn wait_for_connected(&self) -> Result<(), KernelError> {
        let mut rx = self.inner.conn_status_tx.subscribe();
        loop {
            if self.inner.disposed.load(Ordering::SeqCst) {
                return Err(KernelError::ConnectionDisposed);
            }
            let current = *rx.borrow_and_update();
            match current {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Disconnected
                    if self.inner.reconnect_exhausted.load(Ordering::SeqCst) =>
                {
                    return Err(KernelError::Socket(
                        "reconnect attempts exhausted".to_string(),
                    ))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(KernelError::ConnectionDisposed);
            }
        }
    }

    /// Dispose this handle. The shared socket and outstanding table are
    /// torn down when the last live handle is disposed.
    pub fn dispose(&self) {
        if self.handle_disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.live_handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.dispose_all();
        }
    }

    /// Whether this handle (or the whole connection) is disposed.
    pub fn is_disposed(&self) -> bool {
        self.handle_disposed.load(Ordering::SeqCst) || self.inner.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), KernelError> {
        if self.is_disposed() {
            return Err(KernelError::ConnectionDisposed);
        }
        Ok(())
    }
}

impl Drop for KernelConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ----------------------------------------------------------------------
// Socket task
// ----------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Open the socket, advertising the binary subprotocol; the server's
/// selection decides the serializer.
async fn open_socket(
    url: &str,
) -> Result<(WsStream, Arc<dyn MessageSerializer>), KernelError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| KernelError::Socket(e.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(V1_PROTOCOL),
    );

    let (stream, response) = connect_async(request)
        .await
        .map_err(|e| KernelError::Socket(e.to_string()))?;
    let negotiated = response
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    info!(
        "[kernel-connection] Socket open, subprotocol: {}",
        negotiated.as_deref().unwrap_or("(default json)")
    );
    Ok((stream, serializer_for(negotiated.as_deref())))
}

fn frame_to_ws(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data),
    }
}

/// Own the socket: connect (with backoff on failure), pump outbound
/// frames, deserialize inbound frames, and hand them to the router. The
/// `any_message` receive notification is emitted here, synchronously on
/// arrival, so its order reflects the wire even while routing is queued.
fn spawn_socket_task(
    weak: std::sync::Weak<ConnectionInner>,
    mut outbound_rx: mpsc::UnboundedReceiver<KernelMessage>,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
) {
    tokio::spawn(async move {
        let mut policy = match weak.upgrade() {
            Some(inner) => ReconnectPolicy::new(inner.reconnect.clone()),
            None => return,
        };

        'outer: loop {
            let url = {
                let Some(inner) = weak.upgrade() else { return };
                if inner.disposed.load(Ordering::SeqCst) {
                    return;
                }
                inner.set_connection_status(ConnectionStatus::Connecting);
                inner.ws_endpoint()
            };

            match open_socket(&url).await {
                Ok((stream, serializer)) => {
                    policy.reset();
                    {
                        let Some(inner) = weak.upgrade() else { return };
                        inner.reconnect_exhausted.store(false, Ordering::SeqCst);
                        inner.set_connection_status(ConnectionStatus::Connected);
                    }
                    let (mut sink, mut source) = stream.split();

                    loop {
                        tokio::select! {
                            cmd = cmd_rx.recv() => match cmd {
                                Some(SocketCommand::Reconnect) => {
                                    info!("[kernel-connection] Reconnect requested");
                                    let _ = sink.close().await;
                                    policy.reset();
                                    continue 'outer;
                                }
                                Some(SocketCommand::Shutdown) | None => {
                                    debug!("[kernel-connection] Socket task shutting down");
                                    let _ = sink.close().await;
                                    return;
                                }
                            },
                            outbound = outbound_rx.recv() => match outbound {
                                Some(msg) => {
                                    let frame = match serializer.serialize(&msg) {
                                        Ok(frame) => frame,
                                        Err(e) => {
                                            error!("[kernel-connection] Serialize failed: {}", e);
                                            continue;
                                        }
                                    };
                                    if let Err(e) = sink.send(frame_to_ws(frame)).await {
                                        error!("[kernel-connection] Send failed: {}", e);
                                        break;
                                    }
                                }
                                // All senders dropped: the connection is gone
                                None => {
                                    let _ = sink.close().await;
                                    return;
                                }
                            },
                            frame = source.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    deliver(&weak, &serializer, WireFrame::Text(text));
                                }
                                Some(Ok(Message::Binary(data))) => {
                                    deliver(&weak, &serializer, WireFrame::Binary(data));
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    if sink.send(Message::Pong(payload)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("[kernel-connection] Socket closed by peer");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!("[kernel-connection] Socket error: {}", e);
                                    break;
                                }
                            }
                        }
                    }

                    // Socket lost: status goes unknown (not dead), transport
                    // disconnected, then the retry loop takes over
                    let Some(inner) = weak.upgrade() else { return };
                    if inner.disposed.load(Ordering::SeqCst) {
                        return;
                    }
                    inner.set_connection_status(ConnectionStatus::Disconnected);
                    inner.set_status(ExecutionStatus::Unknown);
                }
                Err(e) => {
                    warn!("[kernel-connection] Connect failed: {}", e);
                }
            }

            match policy.next_delay() {
                Some(delay) => {
                    debug!(
                        "[kernel-connection] Retrying in {:?} (attempt {})",
                        delay,
                        policy.attempts()
                    );
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(SocketCommand::Reconnect) => policy.reset(),
                            Some(SocketCommand::Shutdown) | None => return,
                        },
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    let Some(inner) = weak.upgrade() else { return };
                    warn!(
                        "[kernel-connection] Giving up after {} attempts",
                        policy.attempts()
                    );
                    inner.reconnect_exhausted.store(true, Ordering::SeqCst);
                    inner.set_connection_status(ConnectionStatus::Disconnected);
                    inner.set_status(ExecutionStatus::Unknown);
                    drop(inner);
                    // Rest until an explicit reconnect or shutdown
                    match cmd_rx.recv().await {
                        Some(SocketCommand::Reconnect) => policy.reset(),
                        Some(SocketCommand::Shutdown) | None => return,
                    }
                }
            }
        }
    });
}

/// Deserialize one inbound frame, stamp the `any_message` signal, and
/// queue it for routing.
fn deliver(
    weak: &std::sync::Weak<ConnectionInner>,
    serializer: &Arc<dyn MessageSerializer>,
    frame: WireFrame,
) {
    let Some(inner) = weak.upgrade() else { return };
    match serializer.deserialize(frame) {
        Ok(msg) => {
            inner.emit_any(MessageDirection::Recv, &msg);
            let _ = inner.router_tx.send(msg);
        }
        Err(e) => warn!("[kernel-connection] Dropping malformed frame: {}", e),
    }
}
