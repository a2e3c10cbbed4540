//! REST client tests against a loopback HTTP server.
//!
//! The server implements the kernel lifecycle endpoints with canned
//! responses, including the deliberately wrong-status and already-gone
//! cases the client must handle.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::time::timeout;

use kernel_client::messages::ExecuteRequest;
use kernel_client::{
    ConnectOptions, KernelApiClient, KernelConnection, KernelModel, ReconnectConfig, RestError,
    ServerSettings,
};

fn json_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("response builder should not fail")
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("response builder should not fail")
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    required_token: Option<Arc<String>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if let Some(token) = required_token {
        let expected = format!("token {}", token);
        let authorized = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            == Some(expected.as_str());
        if !authorized {
            return Ok(empty_response(StatusCode::FORBIDDEN));
        }
    }

    let method = req.method().as_str();
    let path = req.uri().path();
    let response = match (method, path) {
        ("POST", "/api/kernels") => {
            json_response(StatusCode::CREATED, r#"{"id":"k-9","name":"python3"}"#)
        }
        ("GET", "/api/kernels") => json_response(
            StatusCode::OK,
            r#"[{"id":"k-9","name":"python3","execution_state":"idle"}]"#,
        ),
        ("GET", "/api/kernels/k-9") => json_response(
            StatusCode::OK,
            r#"{"id":"k-9","name":"python3","execution_state":"idle","connections":1}"#,
        ),
        ("POST", "/api/kernels/k-9/interrupt") => empty_response(StatusCode::NO_CONTENT),
        // Misbehaving endpoint: 200 where 204 is expected
        ("POST", "/api/kernels/weird/interrupt") => empty_response(StatusCode::OK),
        ("POST", "/api/kernels/k-9/restart") => {
            json_response(StatusCode::OK, r#"{"id":"k-9","name":"python3"}"#)
        }
        ("DELETE", "/api/kernels/k-9") => empty_response(StatusCode::NO_CONTENT),
        ("GET", "/api/kernels/k-9/subshells") => json_response(StatusCode::OK, r#"["s-1"]"#),
        ("POST", "/api/kernels/k-9/subshells") => {
            json_response(StatusCode::CREATED, r#"{"subshell_id":"s-2"}"#)
        }
        ("DELETE", "/api/kernels/k-9/subshells/s-2") => empty_response(StatusCode::NO_CONTENT),
        // Anything touching an unknown kernel is already gone
        _ => empty_response(StatusCode::NOT_FOUND),
    };
    Ok(response)
}

/// Start the lifecycle API server on a random localhost port.
async fn start_api_server(required_token: Option<String>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let required_token = required_token.map(Arc::new);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let required_token = required_token.clone();
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service =
                    service_fn(move |req| handle(req, required_token.clone()));
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    port
}

async fn client() -> KernelApiClient {
    let port = start_api_server(None).await;
    KernelApiClient::new(ServerSettings::new(format!("http://127.0.0.1:{}", port)))
}

#[tokio::test]
async fn test_start_kernel_parses_model() {
    let client = client().await;
    let model = client.start_kernel("python3").await.unwrap();
    assert_eq!(model.id, "k-9");
    assert_eq!(model.name, "python3");
}

#[tokio::test]
async fn test_list_and_get_kernels() {
    let client = client().await;

    let kernels = client.list_kernels().await.unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].execution_state.as_deref(), Some("idle"));

    let model = client.get_kernel("k-9").await.unwrap();
    assert_eq!(model.connections, Some(1));
}

#[tokio::test]
async fn test_interrupt_and_shutdown_tolerate_missing_kernel() {
    let client = client().await;

    client.interrupt("k-9").await.unwrap();
    client.shutdown("k-9").await.unwrap();

    // 404 means the kernel is already gone: success, not an error
    client.interrupt("gone").await.unwrap();
    client.shutdown("gone").await.unwrap();
}

#[tokio::test]
async fn test_unexpected_success_status_is_an_error() {
    let client = client().await;

    // 200 where 204 was expected must not pass
    let result = client.interrupt("weird").await;
    match result {
        Err(RestError::Status { status, .. }) => assert_eq!(status, 200),
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_get_missing_kernel_is_an_error() {
    let client = client().await;
    let result = client.get_kernel("gone").await;
    match result {
        Err(RestError::Status { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected 404 error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_subshell_lifecycle() {
    let client = client().await;

    let subshells = client.list_subshells("k-9").await.unwrap();
    assert_eq!(subshells, vec!["s-1"]);

    let created = client.create_subshell("k-9").await.unwrap();
    assert_eq!(created, "s-2");

    client.delete_subshell("k-9", "s-2").await.unwrap();
}

#[tokio::test]
async fn test_token_is_sent_and_required() {
    let port = start_api_server(Some("sesame".to_string())).await;
    let base = format!("http://127.0.0.1:{}", port);

    let with_token =
        KernelApiClient::new(ServerSettings::new(base.clone()).with_token("sesame"));
    with_token.list_kernels().await.unwrap();

    let without_token = KernelApiClient::new(ServerSettings::new(base));
    let result = without_token.list_kernels().await;
    match result {
        Err(RestError::Status { status, .. }) => assert_eq!(status, 403),
        other => panic!("expected 403 error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_restart_through_connection_invalidates_generation() {
    // REST on one port, a silent WebSocket kernel on another
    let rest_port = start_api_server(None).await;

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = ws_listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    let (_sink, mut source) = ws.split();
                    while let Some(Ok(_)) = source.next().await {}
                }
            });
        }
    });

    let settings = ServerSettings::new(format!("http://127.0.0.1:{}", rest_port))
        .with_ws_url(format!("ws://{}", ws_addr));
    let model = KernelModel {
        id: "k-9".to_string(),
        name: "python3".to_string(),
        execution_state: None,
        connections: None,
    };
    let options = ConnectOptions {
        reconnect: ReconnectConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
        },
        ..ConnectOptions::default()
    };

    let conn = timeout(
        Duration::from_secs(5),
        KernelConnection::connect(settings, model, options),
    )
    .await
    .expect("connect should finish")
    .unwrap();

    let future = conn
        .request_execute(ExecuteRequest::new("a=1"), true)
        .unwrap();
    let comm = conn.create_comm("widgets", None).unwrap();
    comm.open(serde_json::json!({}), serde_json::json!({}), vec![])
        .unwrap();

    conn.restart().await.unwrap();

    // Everything from the previous generation is disposed...
    assert!(future.is_disposed());
    assert!(comm.is_disposed());
    // ...while the connection itself stays usable
    let fresh = conn
        .request_execute(ExecuteRequest::new("b=2"), true)
        .unwrap();
    assert!(!fresh.is_disposed());
}
