use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use serde_json::{json, Value};
use streamrpc_core::{
    codes, AbortSignal, CallContext, CallOptions, CancelReason, DestroyOptions, ErrorKind,
    Handler, RpcClient, RpcError, RpcServer, ServerConfig, ValueStream,
};
use streamrpc_transport::{memory, RpcStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn config(timeout: Duration, grace: Duration) -> ServerConfig {
    ServerConfig {
        handler_timeout: timeout,
        grace_period: grace,
        ..ServerConfig::default()
    }
}

/// Duplex handler that never yields and ignores its abort signal.
fn stubborn() -> Handler {
    Handler::duplex(|_input: ValueStream, _ctx: CallContext| {
        stream::pending::<streamrpc_core::Result<Value>>()
    })
}

/// Duplex handler that reports in, then fails with the abort reason.
fn cooperative(started: mpsc::UnboundedSender<()>, observed: Arc<AtomicUsize>) -> Handler {
    Handler::duplex(move |_input: ValueStream, ctx: CallContext| {
        let started = started.clone();
        let observed = Arc::clone(&observed);
        stream::once(async move {
            let _ = started.send(());
            let reason = ctx.signal.aborted().await;
            observed.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(reason.to_error())
        })
    })
}

fn assert_near(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected about {expected:?}, got {elapsed:?}"
    );
}

/// Duplex handler that echoes every input back.
fn echo() -> Handler {
    Handler::duplex(|input: ValueStream, _ctx: CallContext| input)
}

async fn wait_for_idle(server: &RpcServer) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while server.active_calls() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("calls should drain");
}

/// Send `header` followed by `follow_up` on one stream, keep the write side
/// open, and return the single response the server answers with.
async fn answer_to(server: &RpcServer, header: &[u8], follow_up: &[u8]) -> Value {
    let mut client = open_raw(server, header).await;
    client
        .write_all(follow_up)
        .await
        .expect("follow-up should be written");
    let mut received = Vec::new();
    client
        .read_to_end(&mut received)
        .await
        .expect("response should arrive");
    serde_json::from_slice(&received).expect("one error response")
}

async fn open_raw(server: &RpcServer, header: &[u8]) -> RpcStream {
    let (mut local, remote) = memory::pair(4096);
    server
        .handle_stream(remote)
        .expect("server should accept the stream");
    local.write_all(header).await.expect("header should be written");
    local
}

#[tokio::test(start_paused = true)]
async fn test_ignored_abort_is_cut_after_grace_period() {
    let server = RpcServer::builder()
        .handler("stuck", stubborn())
        .with_config(config(Duration::from_secs(1), Duration::from_millis(500)))
        .build()
        .expect("server should build");

    let start = Instant::now();
    let mut client = open_raw(&server, br#"{"jsonrpc":"2.0","method":"stuck","id":null}"#).await;
    let mut received = Vec::new();
    let _ = client.read_to_end(&mut received).await;

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1500), "cut too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1600), "cut too late: {elapsed:?}");
    let response: Value = serde_json::from_slice(&received).expect("one error response");
    assert_eq!(response["error"]["code"], json!(codes::TIMED_OUT));
    assert_eq!(response["error"]["data"]["type"], json!("Timeout"));
    server.destroy(DestroyOptions::graceful()).await;
    assert_eq!(server.active_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cooperative_handler_reports_timeout() {
    let (started, _started_rx) = mpsc::unbounded_channel();
    let server = RpcServer::builder()
        .handler("wait", cooperative(started, Arc::default()))
        .with_config(config(Duration::from_secs(1), Duration::from_secs(2)))
        .build()
        .expect("server should build");
    let client = RpcClient::new(server.loopback());

    let start = Instant::now();
    let mut call = client
        .duplex_stream_caller("wait", CallOptions::new())
        .await
        .expect("call should open");
    let err = call.reader.read_value().await.unwrap_err();
    assert_near(start.elapsed(), Duration::from_secs(1));
    assert!(err.is_remote());
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(matches!(err.remote_cause(), Some(RpcError::Timeout(after)) if *after == Duration::from_secs(1)));
}

#[tokio::test(start_paused = true)]
async fn test_missing_header_times_out() {
    let server = RpcServer::builder()
        .handler("stuck", stubborn())
        .with_config(config(Duration::from_secs(1), Duration::from_millis(500)))
        .build()
        .expect("server should build");

    let start = Instant::now();
    let mut client = open_raw(&server, b"").await;
    let mut received = Vec::new();
    let _ = client.read_to_end(&mut received).await;
    assert_near(start.elapsed(), Duration::from_secs(1));
    assert!(received.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_keep_call_alive() {
    let server = RpcServer::builder()
        .handler(
            "chat",
            Handler::duplex(|input: ValueStream, _ctx: CallContext| input),
        )
        .with_config(config(Duration::from_secs(1), Duration::from_millis(500)))
        .build()
        .expect("server should build");
    let client = RpcClient::new(server.loopback());
    let call = client
        .duplex_stream_caller("chat", CallOptions::new())
        .await
        .expect("call should open");
    let (mut writer, mut reader) = call.split();

    for n in 0..4 {
        tokio::time::sleep(Duration::from_millis(800)).await;
        writer.write(&n).await.expect("write should succeed");
        assert_eq!(
            reader.read_value().await.expect("echo should arrive"),
            Some(json!(n))
        );
    }
    writer.close();
    assert_eq!(reader.read_value().await.expect("stream should end"), None);
}

#[tokio::test(start_paused = true)]
async fn test_forced_destroy_aborts_every_call() {
    let (started, mut started_rx) = mpsc::unbounded_channel();
    let observed = Arc::new(AtomicUsize::new(0));
    let server = RpcServer::builder()
        .handler("wait", cooperative(started, Arc::clone(&observed)))
        .build()
        .expect("server should build");
    let client = RpcClient::new(server.loopback());

    let mut calls = Vec::new();
    for _ in 0..3 {
        let call = client
            .duplex_stream_caller("wait", CallOptions::new())
            .await
            .expect("call should open");
        calls.push(call);
    }
    for _ in 0..3 {
        started_rx.recv().await.expect("handler should start");
    }
    assert_eq!(server.active_calls(), 3);

    server.destroy(DestroyOptions::force("shutting down")).await;
    assert_eq!(observed.load(Ordering::SeqCst), 3);
    assert_eq!(server.active_calls(), 0);
    assert!(!server.is_running());

    for mut call in calls {
        let err = call.reader.read_value().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Destroyed);
        assert!(err.is_cancellation());
        assert!(matches!(err.remote_cause(), Some(RpcError::Destroyed(reason)) if reason == "shutting down"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_graceful_destroy_waits_for_running_calls() {
    let (started, mut started_rx) = mpsc::unbounded_channel::<()>();
    let server = RpcServer::builder()
        .handler(
            "slow",
            Handler::unary(move |input: Value, _ctx: CallContext| {
                let started = started.clone();
                async move {
                    let _ = started.send(());
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(input)
                }
            }),
        )
        .build()
        .expect("server should build");
    let client = RpcClient::new(server.loopback());

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .unary_caller::<_, Value>("slow", &json!("done"), CallOptions::new())
                .await
        }
    });
    started_rx.recv().await.expect("handler should start");

    let start = Instant::now();
    let destroy = tokio::spawn({
        let server = server.clone();
        async move { server.destroy(DestroyOptions::graceful()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!server.is_running());
    assert_eq!(server.active_calls(), 1);

    let err = client
        .unary_caller::<_, Value>("slow", &json!("late"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);

    destroy.await.expect("destroy should not panic");
    assert!(start.elapsed() >= Duration::from_millis(4990));
    let out = call
        .await
        .expect("call task should not panic")
        .expect("running call should complete");
    assert_eq!(out, json!("done"));
}

#[tokio::test]
async fn test_stream_after_destroy_is_refused() {
    let server = RpcServer::builder()
        .handler("stuck", stubborn())
        .build()
        .expect("server should build");
    server.destroy(DestroyOptions::graceful()).await;
    server.destroy(DestroyOptions::force("again")).await;

    let (_local, remote) = memory::pair(64);
    assert!(matches!(server.handle_stream(remote), Err(RpcError::NotRunning)));
}

#[tokio::test]
async fn test_cancel_handle_is_idempotent() {
    let (started, mut started_rx) = mpsc::unbounded_channel();
    let server = RpcServer::builder()
        .handler("wait", cooperative(started, Arc::default()))
        .build()
        .expect("server should build");

    let (mut client, remote) = memory::pair(4096);
    let handle = server.handle_stream(remote).expect("server should accept");
    client
        .write_all(br#"{"jsonrpc":"2.0","method":"wait","id":null}"#)
        .await
        .expect("header should be written");
    started_rx.recv().await.expect("handler should start");

    assert!(handle.cancel("operator"));
    assert!(!handle.cancel("operator again"));
    assert_eq!(
        handle.signal().reason(),
        Some(CancelReason::Aborted("operator".into()))
    );

    let mut received = Vec::new();
    client
        .read_to_end(&mut received)
        .await
        .expect("response should arrive");
    let response: Value = serde_json::from_slice(&received).expect("one error response");
    assert_eq!(response["error"]["code"], json!(codes::HANDLER_ABORTED));
    assert_eq!(response["error"]["data"]["type"], json!("Aborted"));
    assert_eq!(response["error"]["data"]["data"]["message"], json!("operator"));

    server.destroy(DestroyOptions::graceful()).await;
    assert!(!handle.cancel("after completion"));
    assert_eq!(server.active_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_deadline_aborts_call() {
    let server = RpcServer::builder()
        .handler("stuck", stubborn())
        .build()
        .expect("server should build");
    let client = RpcClient::new(server.loopback());

    let start = Instant::now();
    let err = client
        .unary_caller::<_, Value>(
            "stuck",
            &json!(null),
            CallOptions::new().with_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
    assert_near(start.elapsed(), Duration::from_secs(2));
    assert!(!err.is_remote());
    assert!(matches!(err, RpcError::Timeout(after) if after == Duration::from_secs(2)));
}

#[tokio::test(start_paused = true)]
async fn test_external_signal_aborts_call() {
    let server = RpcServer::builder()
        .handler("stuck", stubborn())
        .build()
        .expect("server should build");
    let client = RpcClient::new(server.loopback());

    let signal = AbortSignal::new();
    let call = client
        .duplex_stream_caller("stuck", CallOptions::new().with_signal(signal.clone()))
        .await
        .expect("call should open");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        signal.abort(CancelReason::Aborted("user".into()));
    });

    let (_writer, mut reader) = call.split();
    let err = reader.read_value().await.unwrap_err();
    assert!(err.is_cancellation());
    assert!(matches!(err, RpcError::Aborted(reason) if reason == "user"));
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_factory_times_out() {
    let factory = || futures::future::pending::<streamrpc_transport::Result<RpcStream>>();
    let client = RpcClient::new(factory);

    let start = Instant::now();
    let err = client
        .unary_caller::<_, Value>(
            "echo",
            &json!(1),
            CallOptions::new().with_timeout(Duration::from_secs(3)),
        )
        .await
        .unwrap_err();
    assert_near(start.elapsed(), Duration::from_secs(3));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_handler_error_closes_call_while_input_is_open() {
    let server = RpcServer::builder()
        .handler(
            "fail",
            Handler::duplex(|_input: ValueStream, _ctx: CallContext| {
                stream::once(async { Err::<Value, _>(RpcError::HandlerFailed("bad input".into())) })
            }),
        )
        .build()
        .expect("server should build");
    let client = RpcClient::new(server.loopback());
    let call = client
        .duplex_stream_caller("fail", CallOptions::new())
        .await
        .expect("call should open");
    let (writer, mut reader) = call.split();

    let err = reader.read_value().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandlerFailed);
    wait_for_idle(&server).await;
    assert!(!writer.is_closed());
    assert_eq!(reader.read_value().await.expect("stream should end"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cancels_abort_once_and_release_timer_once() {
    let (timers_tx, mut timers_rx) = mpsc::unbounded_channel();
    let server = RpcServer::builder()
        .handler(
            "wait",
            Handler::duplex(move |_input: ValueStream, ctx: CallContext| {
                let _ = timers_tx.send(ctx.timer.clone());
                stream::once(async move { Err::<Value, _>(ctx.signal.aborted().await.to_error()) })
            }),
        )
        .build()
        .expect("server should build");

    let (mut client, remote) = memory::pair(4096);
    let handle = server.handle_stream(remote).expect("server should accept");
    client
        .write_all(br#"{"jsonrpc":"2.0","method":"wait","id":null}"#)
        .await
        .expect("header should be written");
    let timer = timers_rx.recv().await.expect("handler should start");

    let racers = 8;
    let barrier = Arc::new(tokio::sync::Barrier::new(racers));
    let tasks: Vec<_> = (0..racers)
        .map(|n| {
            let handle = handle.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                handle.cancel(format!("racer {n}"))
            })
        })
        .collect();
    let mut winners = 0;
    for task in tasks {
        if task.await.expect("racer should not panic") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(matches!(
        handle.signal().reason(),
        Some(CancelReason::Aborted(reason)) if reason.starts_with("racer ")
    ));

    let mut received = Vec::new();
    client
        .read_to_end(&mut received)
        .await
        .expect("response should arrive");
    let response: Value = serde_json::from_slice(&received).expect("one error response");
    assert_eq!(response["error"]["data"]["type"], json!("Aborted"));

    server.destroy(DestroyOptions::graceful()).await;
    assert_eq!(server.active_calls(), 0);
    assert!(timer.is_released());
    assert!(!timer.cancel());
}

#[tokio::test]
async fn test_oversized_input_ends_live_call() {
    let server = RpcServer::builder()
        .handler("chat", echo())
        .with_config(ServerConfig {
            max_message_bytes: 64,
            ..ServerConfig::default()
        })
        .build()
        .expect("server should build");

    let follow_up = format!(r#"{{"jsonrpc":"2.0","params":{{"blob":"{}"}}}}"#, "x".repeat(200));
    let response = answer_to(
        &server,
        br#"{"jsonrpc":"2.0","method":"chat","id":null}"#,
        follow_up.as_bytes(),
    )
    .await;
    assert_eq!(response["error"]["code"], json!(codes::MESSAGE_LENGTH));
    assert_eq!(response["error"]["data"]["type"], json!("MessageLength"));
    wait_for_idle(&server).await;
}

#[tokio::test]
async fn test_malformed_input_ends_live_call() {
    let server = RpcServer::builder()
        .handler("chat", echo())
        .build()
        .expect("server should build");

    let follow_ups: [&[u8]; 2] = [
        br#"{"jsonrpc":"2.0","params":nope}"#,
        br#"{"jsonrpc":"2.0","result":1,"id":null}"#,
    ];
    for follow_up in follow_ups {
        let response = answer_to(
            &server,
            br#"{"jsonrpc":"2.0","method":"chat","id":null}"#,
            follow_up,
        )
        .await;
        assert_eq!(response["error"]["code"], json!(codes::PARSE_ERROR));
        assert_eq!(response["error"]["data"]["type"], json!("Parse"));
    }
    wait_for_idle(&server).await;
}
