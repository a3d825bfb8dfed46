// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

use fast_protocol::protocol::{FastMessage, FastMessageKind, MAX_DATAGRAM_SIZE};
use fast_protocol::transport::UdpTransport;
use fast_protocol::{
    Client, Context, FastConfig, FastError, HandlerError, LoggingMiddleware, Next,
    RemoteErrorCode, Response, Server,
};

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn client_config() -> FastConfig {
    FastConfig::default()
        .with_bind_address("127.0.0.1:0")
        .with_request_timeout(Duration::from_millis(500))
        .with_sweep_interval(Duration::from_millis(10))
}

async fn start_server(server: &Arc<Server>) -> SocketAddr {
    let transport = UdpTransport::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = transport.local_addr();
    let running = Arc::clone(server);
    tokio::spawn(async move { running.serve(transport).await });
    addr
}

fn demo_server() -> Arc<Server> {
    let server = Arc::new(Server::new(FastConfig::default(), Some(&test_log())));
    server
        .on("/echo", |ctx: Context| async move {
            Ok::<_, HandlerError>(Response::new(ctx.payload().clone()))
        })
        .on_fn("/uppercase", |ctx| {
            Ok(Response::text(ctx.text()?.to_uppercase()))
        })
        .on_fn("/json", |ctx| {
            let data: Value = ctx.json()?;
            Ok(Response::json(&json!({ "echo": data }))?)
        })
        .on_fn("/fail", |_ctx| Err("handler refused".into()))
        .on("/slow", |_ctx: Context| async move {
            sleep(Duration::from_millis(400)).await;
            Ok::<_, HandlerError>(Response::text("slow"))
        });
    server
}

async fn connected_client(addr: SocketAddr, config: FastConfig) -> Client {
    let client = Client::new(addr.to_string(), config, Some(&test_log()));
    client.connect().await.expect("failed to connect");
    client
}

/// A peer that records every datagram and never answers.
async fn silent_peer() -> (SocketAddr, Arc<Mutex<Vec<FastMessage>>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while let Ok((n, _)) = socket.recv_from(&mut buf).await {
            if let Ok(msg) = FastMessage::parse(&buf[..n]) {
                record.lock().unwrap().push(msg);
            }
        }
    });
    (addr, seen)
}

#[tokio::test]
async fn echo_uppercase_and_json() {
    let server = demo_server();
    let addr = start_server(&server).await;
    let client = connected_client(addr, client_config()).await;

    let echoed = client.request("/echo", "Hello, World!").await.unwrap();
    assert_eq!(echoed, Bytes::from("Hello, World!"));

    let upper = client.request_text("/uppercase", "hello world").await.unwrap();
    assert_eq!(upper, "HELLO WORLD");

    let reply: Value = client
        .request_json("/json", &json!({"name": "Alice"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"echo": {"name": "Alice"}}));

    assert_eq!(client.pending_count(), 0);
    client.disconnect().await;
    server.stop();
}

#[tokio::test]
async fn unknown_route_and_handler_failure_are_tagged_errors() {
    let server = demo_server();
    let addr = start_server(&server).await;
    let client = connected_client(addr, client_config()).await;

    match client.request("/missing", "x").await {
        Err(FastError::Remote(err)) => {
            assert_eq!(err.code, RemoteErrorCode::RouteNotFound);
            assert_eq!(err.route, "/missing");
        }
        other => panic!("expected route-not-found, got {:?}", other),
    }

    match client.request("/fail", "x").await {
        Err(FastError::Remote(err)) => {
            assert_eq!(err.code, RemoteErrorCode::HandlerFailed);
            assert_eq!(err.message, "handler refused");
        }
        other => panic!("expected handler failure, got {:?}", other),
    }

    // An empty successful reply is still a success.
    server.on_fn("/nothing", |_ctx| Ok(Response::empty()));
    assert_eq!(client.request("/nothing", "").await.unwrap(), Bytes::new());

    client.disconnect().await;
    server.stop();
}

#[tokio::test]
async fn fire_reaches_handler_and_unknown_fire_is_silent() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = demo_server();
    let counter = Arc::clone(&hits);
    server.on_fn("/log", move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Response::empty())
    });
    let addr = start_server(&server).await;
    let client = connected_client(addr, client_config()).await;

    client.send("/log", "one").await.unwrap();
    client.send("/nowhere", "two").await.unwrap();
    client.send_json("/log", &json!({"n": 3})).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while hits.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().route_not_found, 1);
    assert_eq!(client.pending_count(), 0);

    client.disconnect().await;
    server.stop();
}

#[tokio::test]
async fn unanswered_request_retries_then_times_out() {
    let (addr, seen) = silent_peer().await;
    let config = client_config()
        .with_request_timeout(Duration::from_millis(100))
        .with_max_retries(2);
    let client = connected_client(addr, config).await;

    let started = Instant::now();
    let result = client.request("/echo", "anyone?").await;
    let elapsed = started.elapsed();

    match result {
        Err(FastError::RequestTimedOut { attempts, route, .. }) => {
            assert_eq!(attempts, 3);
            assert_eq!(route, "/echo");
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(300));

    sleep(Duration::from_millis(50)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|m| m.kind == FastMessageKind::Request));
    assert!(seen.iter().all(|m| m.id == seen[0].id));
    drop(seen);

    assert_eq!(client.pending_count(), 0);
    client.disconnect().await;
}

#[tokio::test]
async fn retransmission_recovers_a_lost_request() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        // Drop the first copy, answer the retransmission.
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        let first = FastMessage::parse(&buf[..n]).unwrap();
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        let second = FastMessage::parse(&buf[..n]).unwrap();
        assert_eq!(first.id, second.id);
        let reply = FastMessage::response(second.id, second.route, Bytes::from_static(b"\x00late"));
        socket
            .send_to(&reply.to_datagram(MAX_DATAGRAM_SIZE).unwrap(), from)
            .await
            .unwrap();
    });

    let config = client_config().with_request_timeout(Duration::from_millis(100));
    let client = connected_client(addr, config).await;
    assert_eq!(
        client.request("/echo", "hello").await.unwrap(),
        Bytes::from("late")
    );
    peer.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn duplicate_responses_are_ignored() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut answered = 0u8;
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let req = FastMessage::parse(&buf[..n]).unwrap();
            answered += 1;
            for body in &[b"\x00first".as_ref(), b"\x00second".as_ref()] {
                let reply = FastMessage::response(
                    req.id,
                    req.route.clone(),
                    Bytes::copy_from_slice(body),
                );
                let datagram = reply.to_datagram(MAX_DATAGRAM_SIZE).unwrap();
                socket.send_to(&datagram, from).await.unwrap();
            }
            if answered == 2 {
                break;
            }
        }
    });

    let client = connected_client(addr, client_config()).await;
    assert_eq!(client.request("/dup", "a").await.unwrap(), Bytes::from("first"));
    // The stray second copy must not resolve the next request.
    assert_eq!(client.request("/dup", "b").await.unwrap(), Bytes::from("first"));
    assert_eq!(client.pending_count(), 0);
    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_cancels_all_outstanding_requests() {
    let (addr, _seen) = silent_peer().await;
    let config = client_config().with_request_timeout(Duration::from_secs(30));
    let client = Arc::new(connected_client(addr, config).await);

    let calls: Vec<_> = (0..5)
        .map(|i| {
            let c = Arc::clone(&client);
            tokio::spawn(async move { c.request("/wait", format!("call {}", i)).await })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(2);
    while client.pending_count() < 5 && Instant::now() < deadline {
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(client.pending_count(), 5);

    client.disconnect().await;
    for call in calls {
        let result = timeout(Duration::from_millis(100), call)
            .await
            .expect("waiter was not released")
            .unwrap();
        assert!(matches!(result, Err(FastError::Cancelled)));
    }
    assert!(matches!(
        client.request("/wait", "after").await,
        Err(FastError::NotConnected)
    ));
}

#[tokio::test]
async fn pending_table_applies_backpressure() {
    let (addr, _seen) = silent_peer().await;
    let config = client_config()
        .with_request_timeout(Duration::from_secs(30))
        .with_max_pending_requests(2);
    let client = Arc::new(connected_client(addr, config).await);

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let c = Arc::clone(&client);
            tokio::spawn(async move { c.request("/wait", "x").await })
        })
        .collect();
    let deadline = Instant::now() + Duration::from_secs(2);
    while client.pending_count() < 2 && Instant::now() < deadline {
        sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(
        client.request("/wait", "x").await,
        Err(FastError::TooManyPendingRequests(2))
    ));

    client.disconnect().await;
    for w in waiters {
        assert!(matches!(w.await.unwrap(), Err(FastError::Cancelled)));
    }
}

#[tokio::test]
async fn slow_handler_does_not_block_others() {
    let server = demo_server();
    let addr = start_server(&server).await;
    let client = Arc::new(connected_client(addr, client_config()).await);

    let slow_client = Arc::clone(&client);
    let slow = tokio::spawn(async move { slow_client.request("/slow", "").await });
    sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let fast = client.request("/echo", "quick").await.unwrap();
    assert_eq!(fast, Bytes::from("quick"));
    assert!(started.elapsed() < Duration::from_millis(300));

    assert_eq!(slow.await.unwrap().unwrap(), Bytes::from("slow"));
    client.disconnect().await;
    server.stop();
}

#[tokio::test]
async fn listen_reports_bind_failure() {
    let taken = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(FastConfig::default(), Some(&test_log()));
    match server.listen(&taken.local_addr().to_string()).await {
        Err(FastError::Bind { .. }) => (),
        other => panic!("expected bind error, got {:?}", other),
    }
}

#[tokio::test]
async fn replies_from_other_peers_do_not_resolve_requests() {
    let (addr, seen) = silent_peer().await;
    let config = client_config()
        .with_request_timeout(Duration::from_millis(300))
        .with_max_retries(0);
    let client = Arc::new(connected_client(addr, config).await);
    let local = client.local_addr().unwrap();

    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.request("/echo", "who answers?").await });

    let deadline = Instant::now() + Duration::from_secs(2);
    let id = loop {
        if let Some(msg) = seen.lock().unwrap().first() {
            break msg.id;
        }
        assert!(Instant::now() < deadline, "request never reached the server");
        sleep(Duration::from_millis(5)).await;
    };

    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let forged = FastMessage::response(id, "/echo", Bytes::from_static(b"\x00forged"))
        .to_datagram(MAX_DATAGRAM_SIZE)
        .unwrap();
    stranger.send_to(&forged, local).await.unwrap();

    match call.await.unwrap() {
        Err(FastError::RequestTimedOut { attempts, .. }) => assert_eq!(attempts, 1),
        other => panic!("expected timeout, got {:?}", other),
    }
    client.disconnect().await;
}

#[tokio::test]
async fn middleware_wraps_every_handler() {
    let server = demo_server();
    server
        .with_middleware(LoggingMiddleware::new(&test_log()))
        .with_middleware(|ctx: Context, next: Next| async move {
            if ctx.route() == "/echo" && ctx.payload().is_empty() {
                return Ok::<_, HandlerError>(Response::text("nothing to echo"));
            }
            next.run(ctx).await
        });
    let addr = start_server(&server).await;
    let client = connected_client(addr, client_config()).await;

    assert_eq!(
        client.request("/echo", "").await.unwrap(),
        Bytes::from("nothing to echo")
    );
    assert_eq!(client.request_text("/uppercase", "abc").await.unwrap(), "ABC");
    match client.request("/fail", "x").await {
        Err(FastError::Remote(err)) => assert_eq!(err.code, RemoteErrorCode::HandlerFailed),
        other => panic!("expected handler failure, got {:?}", other),
    }

    client.disconnect().await;
    server.stop();
}
