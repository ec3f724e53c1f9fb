//! Integration tests for the acceptor: real TCP clients against a running
//! server.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tether::{
    connect_stream, connect_tcp, Config, Connection, Exposed, ExposedService, Service,
    SocketStream, TetherError, VoidService,
};
use tether_server::{
    Authenticated, NoAuthenticator, ServerError, ServerHandle, ServerOptions, TetherServer,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Echo service that records the credentials of every connection it sees.
fn recording_service(seen: Arc<Mutex<Vec<Option<serde_json::Value>>>>) -> Arc<dyn Service> {
    Arc::new(
        ExposedService::new("EchoService", |_| {
            Exposed::builder("server_tests", "Echo")
                .exposed("echo", |args| Ok(args.get(0)?.clone()))
                .build_arc()
        })
        .with_on_connect(move |conn| {
            seen.lock().unwrap().push(conn.config().credentials.clone());
            Ok(())
        }),
    )
}

async fn start(options: ServerOptions) -> (ServerHandle, Arc<Mutex<Vec<Option<serde_json::Value>>>>) {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = TetherServer::start(recording_service(seen.clone()), options)
        .await
        .unwrap();
    (handle, seen)
}

fn client(port: u16) -> Connection {
    connect_tcp("127.0.0.1", port, Arc::new(VoidService), Config::default()).unwrap()
}

/// Reads a newline-terminated token before the protocol starts.
fn token_authenticator(stream: TcpStream) -> tether_server::Result<Authenticated> {
    let mut token = Vec::new();
    let mut byte = [0u8; 1];
    let mut reader = &stream;
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        token.push(byte[0]);
    }
    if token != b"open sesame" {
        return Err(ServerError::Authentication(format!(
            "unknown token {:?}",
            String::from_utf8_lossy(&token)
        )));
    }
    let credentials = serde_json::json!({ "user": "ali baba" });
    Ok((Box::new(SocketStream::from_tcp(stream)), Some(credentials)))
}

fn client_with_token(port: u16, token: &str) -> Connection {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(format!("{}\n", token).as_bytes()).unwrap();
    connect_stream(
        SocketStream::from_tcp(stream),
        Arc::new(VoidService),
        Config::default(),
    )
    .unwrap()
}

fn wait_for(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_serves_clients_over_tcp() {
    let (mut handle, seen) = start(ServerOptions::default()).await;
    let port = handle.port;

    let echoed = tokio::task::spawn_blocking(move || {
        let conn = client(port);
        let root = conn.root()?;
        let reply = root.invoke("echo", ["over the wire"])?;
        let aliases = conn.remote_service_aliases()?;
        Ok::<_, TetherError>((reply.as_str().map(str::to_string), aliases))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(echoed.0.as_deref(), Some("over the wire"));
    assert_eq!(echoed.1, vec!["ECHO".to_string()]);

    assert_eq!(seen.lock().unwrap().as_slice(), &[None]);
    handle.shutdown();
    handle.stopped().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_config_carries_endpoints() {
    let (handle, _) = start(ServerOptions::default()).await;
    let port = handle.port;

    let conn = tokio::task::spawn_blocking(move || {
        let conn = client(port);
        conn.ping().unwrap();
        conn
    })
    .await
    .unwrap();

    let served = handle.connections();
    assert_eq!(served.len(), 1);
    let endpoints = served[0].endpoints().unwrap();
    assert!(endpoints.local.ends_with(&format!(":{}", port)));
    assert_eq!(
        Some(endpoints.remote.clone()),
        conn.endpoints().map(|e| e.local.clone())
    );
    tokio::task::spawn_blocking(move || conn.close()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_authenticator_credentials_reach_the_connection() {
    let options = ServerOptions::default().with_authenticator(token_authenticator);
    let (handle, seen) = start(options).await;
    let port = handle.port;

    let reply = tokio::task::spawn_blocking(move || {
        let conn = client_with_token(port, "open sesame");
        let reply = conn.root()?.invoke("echo", [1])?;
        Ok::<_, TetherError>(reply.as_i64())
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply, Some(1));
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[Some(serde_json::json!({ "user": "ali baba" }))]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_peer_is_disconnected() {
    let options = ServerOptions::default().with_authenticator(token_authenticator);
    let (handle, seen) = start(options).await;
    let port = handle.port;

    let err = tokio::task::spawn_blocking(move || {
        let conn = client_with_token(port, "let me in");
        conn.root().unwrap_err()
    })
    .await
    .unwrap();
    assert!(err.is_fatal());
    assert!(seen.lock().unwrap().is_empty());
    assert!(handle.connections().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_max_connections_guard() {
    let options = ServerOptions::default()
        .with_authenticator(NoAuthenticator)
        .with_max_connections(1);
    let (handle, _) = start(options).await;
    let port = handle.port;

    let (first, refused) = tokio::task::spawn_blocking(move || {
        let first = client(port);
        first.ping().unwrap();
        let second = client(port);
        (first, second.root().unwrap_err())
    })
    .await
    .unwrap();
    assert!(refused.is_fatal());
    assert_eq!(handle.active_connections(), 1);
    tokio::task::spawn_blocking(move || first.close()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_live_connections() {
    let (mut handle, _) = start(ServerOptions::default()).await;
    let port = handle.port;

    let conn = tokio::task::spawn_blocking(move || {
        let conn = client(port);
        conn.ping().unwrap();
        conn
    })
    .await
    .unwrap();
    assert_eq!(handle.connections().len(), 1);

    handle.shutdown();
    handle.stopped().await;

    let closed = tokio::task::spawn_blocking(move || {
        wait_for(|| {
            let _ = conn.poll_all(Some(Duration::from_millis(10)));
            conn.closed()
        })
    })
    .await
    .unwrap();
    assert!(closed);
    assert!(wait_for(|| handle.active_connections() == 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_peer_still_handshaking() {
    let entered = Arc::new(AtomicBool::new(false));
    let entered_auth = entered.clone();
    let slow_authenticator = move |stream: TcpStream| -> tether_server::Result<Authenticated> {
        entered_auth.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        Ok((Box::new(SocketStream::from_tcp(stream)), None))
    };
    let options = ServerOptions::default().with_authenticator(slow_authenticator);
    let (mut handle, seen) = start(options).await;
    let port = handle.port;

    let conn = tokio::task::spawn_blocking(move || client(port)).await.unwrap();
    let waiting = entered.clone();
    assert!(tokio::task::spawn_blocking(move || wait_for(|| waiting.load(Ordering::SeqCst)))
        .await
        .unwrap());

    handle.shutdown();
    handle.stopped().await;

    let closed = tokio::task::spawn_blocking(move || {
        wait_for(|| {
            let _ = conn.poll_all(Some(Duration::from_millis(10)));
            conn.closed()
        })
    })
    .await
    .unwrap();
    assert!(closed);
    assert!(wait_for(|| handle.active_connections() == 0));
    assert!(handle.connections().is_empty());
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_hook_frees_its_slot() {
    init_tracing();
    let first = Arc::new(AtomicBool::new(true));
    let service: Arc<dyn Service> = Arc::new(
        ExposedService::new("EchoService", |_| {
            Exposed::builder("server_tests", "Echo")
                .exposed("echo", |args| Ok(args.get(0)?.clone()))
                .build_arc()
        })
        .with_on_connect(move |_| {
            if first.swap(false, Ordering::SeqCst) {
                panic!("first peer is turned away");
            }
            Ok(())
        }),
    );
    let options = ServerOptions::default().with_max_connections(1);
    let handle = TetherServer::start(service, options).await.unwrap();
    let port = handle.port;

    let refused = tokio::task::spawn_blocking(move || client(port).root().unwrap_err())
        .await
        .unwrap();
    assert!(refused.is_fatal());
    assert!(wait_for(|| handle.active_connections() == 0));

    let reply = tokio::task::spawn_blocking(move || {
        let conn = client(port);
        let reply = conn.root()?.invoke("echo", ["second"])?;
        conn.close()?;
        Ok::<_, TetherError>(reply.as_str().map(str::to_string))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.as_deref(), Some("second"));
}
