//! Integration tests against a scripted loopback WebSocket kernel.
//!
//! These tests stand up a real socket server, connect a `KernelConnection`
//! to it, and drive the public API end to end.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;

use kernel_client::messages::{ExecuteRequest, KernelInfoReply, Status};
use kernel_client::serializer::JsonSerializer;
use kernel_client::{
    Channel, ConnectOptions, ConnectionStatus, ExecutionStatus, KernelConnection, KernelMessage,
    KernelModel, MessageSerializer, ReconnectConfig, ServerSettings, WireFrame,
};

/// Script: inbound message -> messages the kernel sends back.
type Script = Arc<dyn Fn(&KernelMessage) -> Vec<KernelMessage> + Send + Sync>;

fn test_model() -> KernelModel {
    KernelModel {
        id: "k-test".to_string(),
        name: "python3".to_string(),
        execution_state: None,
        connections: None,
    }
}

fn fast_reconnect() -> ConnectOptions {
    ConnectOptions {
        reconnect: ReconnectConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
        },
        ..ConnectOptions::default()
    }
}

/// Kernel-side message parented to a client request.
fn kernel_reply(parent: &KernelMessage, msg_type: &str, channel: Channel, content: serde_json::Value) -> KernelMessage {
    let mut msg = KernelMessage::new(msg_type, channel, content, "kernel-session", "kernel");
    msg.set_parent(parent.header.clone());
    msg
}

fn busy(parent: &KernelMessage) -> KernelMessage {
    kernel_reply(
        parent,
        Status::MSG_TYPE,
        Channel::IOPub,
        serde_json::json!({"execution_state": "busy"}),
    )
}

fn idle(parent: &KernelMessage) -> KernelMessage {
    kernel_reply(
        parent,
        Status::MSG_TYPE,
        Channel::IOPub,
        serde_json::json!({"execution_state": "idle"}),
    )
}

/// Spawn a scripted kernel: every accepted socket reads client messages
/// and answers with whatever the script returns.
async fn spawn_scripted_kernel(script: Script) -> ServerSettings {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let script = script.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(frame)) = source.next().await {
                    let text = match frame {
                        Message::Text(text) => text,
                        Message::Close(_) => return,
                        _ => continue,
                    };
                    let Ok(msg) = JsonSerializer.deserialize(WireFrame::Text(text)) else {
                        continue;
                    };
                    for reply in script(&msg) {
                        let Ok(WireFrame::Text(out)) = JsonSerializer.serialize(&reply) else {
                            continue;
                        };
                        if sink.send(Message::Text(out)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    ServerSettings::new(format!("http://{}", addr))
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_execute_roundtrip_resolves_after_reply_and_idle() {
    init_logging();
    let settings = spawn_scripted_kernel(Arc::new(|msg| {
        if msg.msg_type() == ExecuteRequest::MSG_TYPE {
            vec![
                busy(msg),
                idle(msg),
                kernel_reply(
                    msg,
                    "execute_reply",
                    Channel::Shell,
                    serde_json::json!({"status": "ok", "execution_count": 1}),
                ),
            ]
        } else {
            vec![]
        }
    }))
    .await;

    let conn = KernelConnection::connect(settings, test_model(), fast_reconnect())
        .await
        .unwrap();
    assert_eq!(conn.connection_status(), ConnectionStatus::Connected);

    let future = conn
        .request_execute(ExecuteRequest::new("a=1"), true)
        .unwrap();

    let reply = timeout(Duration::from_secs(5), future.done())
        .await
        .expect("done should resolve")
        .unwrap()
        .expect("a reply was expected");
    assert_eq!(reply.msg_type(), "execute_reply");
    assert_eq!(reply.content["status"], "ok");

    // Default dispose_on_done: the future removed itself on completion
    assert!(future.is_disposed());
    // Busy/idle statuses flowed into the kernel status machine
    assert_eq!(conn.status(), ExecutionStatus::Idle);
}

#[tokio::test]
async fn test_idle_before_reply_still_resolves_once() {
    init_logging();
    // The idle status arrives before the shell reply; done must wait for
    // both and then resolve normally
    let settings = spawn_scripted_kernel(Arc::new(|msg| {
        if msg.msg_type() == ExecuteRequest::MSG_TYPE {
            vec![
                busy(msg),
                idle(msg),
                kernel_reply(
                    msg,
                    "execute_reply",
                    Channel::Shell,
                    serde_json::json!({"status": "ok"}),
                ),
            ]
        } else {
            vec![]
        }
    }))
    .await;

    let conn = KernelConnection::connect(settings, test_model(), fast_reconnect())
        .await
        .unwrap();

    let done_count = Arc::new(Mutex::new(0usize));
    let future = conn
        .request_execute(ExecuteRequest::new("a=1"), true)
        .unwrap();
    let count = done_count.clone();
    future.on_done(move |reply| {
        assert!(reply.is_some());
        *count.lock().unwrap() += 1;
    });

    timeout(Duration::from_secs(5), future.done())
        .await
        .expect("done should resolve")
        .unwrap();
    assert_eq!(*done_count.lock().unwrap(), 1);

    // done() is idempotent once resolved
    assert!(future.done().await.is_ok());
    assert_eq!(*done_count.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_comm_message_roundtrip() {
    init_logging();
    // The kernel answers any comm_open on target "test" with a greeting
    let settings = spawn_scripted_kernel(Arc::new(|msg| {
        if msg.msg_type() == "comm_open" {
            let comm_id = msg.content["comm_id"].as_str().unwrap_or("").to_string();
            vec![KernelMessage::new(
                "comm_msg",
                Channel::IOPub,
                serde_json::json!({"comm_id": comm_id, "data": "hello"}),
                "kernel-session",
                "kernel",
            )]
        } else {
            vec![]
        }
    }))
    .await;

    let conn = KernelConnection::connect(settings, test_model(), fast_reconnect())
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let comm = conn.create_comm("test", None).unwrap();
    let r = received.clone();
    comm.on_msg(move |msg| {
        if let Some(data) = msg.content["data"].as_str() {
            r.lock().unwrap().push(data.to_string());
        }
    });
    comm.open(serde_json::json!({}), serde_json::json!({}), vec![])
        .unwrap();

    wait_until("comm greeting", || !received.lock().unwrap().is_empty()).await;
    assert_eq!(*received.lock().unwrap(), vec!["hello"]);
}

#[tokio::test]
async fn test_kernel_info_reply_is_cached() {
    init_logging();
    let settings = spawn_scripted_kernel(Arc::new(|msg| {
        if msg.msg_type() == "kernel_info_request" {
            vec![
                idle(msg),
                kernel_reply(
                    msg,
                    KernelInfoReply::MSG_TYPE,
                    Channel::Shell,
                    serde_json::json!({
                        "status": "ok",
                        "protocol_version": "5.3",
                        "implementation": "mockkernel",
                        "banner": "mock kernel for tests"
                    }),
                ),
            ]
        } else {
            vec![]
        }
    }))
    .await;

    let conn = KernelConnection::connect(settings, test_model(), fast_reconnect())
        .await
        .unwrap();

    let future = conn.request_kernel_info().unwrap();
    let info: KernelInfoReply = timeout(Duration::from_secs(5), future.reply_as())
        .await
        .expect("reply should arrive")
        .unwrap();
    assert_eq!(info.implementation, "mockkernel");

    let cached = conn.kernel_info().expect("info should be cached");
    assert_eq!(cached.protocol_version, "5.3");
}

#[tokio::test]
async fn test_any_message_reflects_send_and_recv() {
    init_logging();
    let settings = spawn_scripted_kernel(Arc::new(|msg| {
        if msg.msg_type() == ExecuteRequest::MSG_TYPE {
            vec![busy(msg)]
        } else {
            vec![]
        }
    }))
    .await;

    let conn = KernelConnection::connect(settings, test_model(), fast_reconnect())
        .await
        .unwrap();
    let mut any = conn.subscribe_any_message();

    conn.request_execute(ExecuteRequest::new("a=1"), true)
        .unwrap();

    let sent = timeout(Duration::from_secs(5), any.recv()).await.unwrap().unwrap();
    assert_eq!(sent.direction, kernel_client::MessageDirection::Send);
    assert_eq!(sent.msg.msg_type(), "execute_request");

    let received = timeout(Duration::from_secs(5), any.recv()).await.unwrap().unwrap();
    assert_eq!(received.direction, kernel_client::MessageDirection::Recv);
    assert_eq!(received.msg.msg_type(), "status");
}

#[tokio::test]
async fn test_socket_loss_reconnects_and_leaves_futures_pending() {
    init_logging();
    // First connection is dropped by the server; the client backs off and
    // reconnects to the second accept
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // First accept: handshake, then hang up
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                drop(ws);
            }
        }
        // Give the client time to observe the loss
        sleep(Duration::from_millis(300)).await;
        // Second accept: stay connected
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                let (_sink, mut source) = ws.split();
                while let Some(Ok(_)) = source.next().await {}
            }
        }
    });

    let settings = ServerSettings::new(format!("http://{}", addr));
    let conn = KernelConnection::connect(settings, test_model(), fast_reconnect())
        .await
        .unwrap();

    // Socket loss is a status transition, not an error
    wait_until("disconnect", || {
        conn.connection_status() != ConnectionStatus::Connected
    })
    .await;
    assert_eq!(conn.status(), ExecutionStatus::Unknown);

    wait_until("reconnect", || {
        conn.connection_status() == ConnectionStatus::Connected
    })
    .await;

    // A request sent after recovery reaches the wire and stays pending
    // (the silent server never answers)
    let future = conn
        .request_execute(ExecuteRequest::new("a=1"), true)
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(!future.is_done());
    assert!(!future.is_disposed());
}

#[tokio::test]
async fn test_connect_fails_when_no_server_listens() {
    init_logging();
    // Bind a port and close it again so nothing is listening
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let settings = ServerSettings::new(format!("http://{}", addr));
    let options = ConnectOptions {
        reconnect: ReconnectConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        },
        ..ConnectOptions::default()
    };

    let result = timeout(
        Duration::from_secs(10),
        KernelConnection::connect(settings, test_model(), options),
    )
    .await
    .expect("connect should give up");
    assert!(result.is_err());
}
