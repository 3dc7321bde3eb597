//! End-to-end tests: two cores talking over in-memory streams.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use callwire::middleware::{handle_fn, middleware_fn, request_not_nil, HandleFunc, REQUEST_NIL};
use callwire::protocol::FrameBuffer;
use callwire::{
    Callable, ChannelWriter, Core, Function, Headers, Middleware, RequestContext, RpcError,
    SignalCallable, TimeWheel,
};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn echo(_ctx: RequestContext, s: String) -> callwire::Result<String> {
    Ok(s)
}

async fn add_one(_ctx: RequestContext, n: i64) -> callwire::Result<i64> {
    Ok(n + 1)
}

async fn explode(_ctx: RequestContext) -> callwire::Result<()> {
    panic!("boom")
}

async fn slow(_ctx: RequestContext) -> callwire::Result<()> {
    tokio::time::sleep(Duration::from_secs(10)).await;
    Ok(())
}

fn server_core() -> Core {
    let core = Core::new();
    core.register(Function::with_input_output(echo), &[]).unwrap();
    core.register(Function::with_input_output(add_one), &[]).unwrap();
    core.register(Function::new(explode), &[]).unwrap();
    core.register(Function::new(slow), &[]).unwrap();
    core
}

/// Join two cores with a duplex stream and start both ends.
fn connect(server: &Core, client: &Core) -> (Callable, Callable) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server_side = Callable::from_stream(server, a);
    let client_side = Callable::from_stream(client, b);
    server.start();
    client.start();
    server_side.start();
    client_side.start();
    (server_side, client_side)
}

fn record(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Middleware {
    middleware_fn(move |next: HandleFunc| {
        let log = log.clone();
        handle_fn(move |ctx| {
            let next = next.clone();
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("{}-in", name));
                next(&mut *ctx).await;
                log.lock().unwrap().push(format!("{}-out", name));
            })
        })
    })
}

#[tokio::test]
async fn test_echo() {
    let (server, client) = (server_core(), Core::new());
    let (_s, c) = connect(&server, &client);

    let mut out = String::new();
    c.call_in_out(TIMEOUT, "echo", "hello".to_string(), &mut out)
        .await
        .unwrap();
    assert_eq!(out, "hello");
}

#[tokio::test]
async fn test_unknown_method_leaves_output_untouched() {
    let (server, client) = (server_core(), Core::new());
    let (_s, c) = connect(&server, &client);

    let mut out = "untouched".to_string();
    let err = c
        .call_in_out(TIMEOUT, "nope", "x".to_string(), &mut out)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::FunctionNotFound));
    assert_eq!(out, "untouched");
}

#[tokio::test]
async fn test_panicking_handler_does_not_kill_the_connection() {
    let (server, client) = (server_core(), Core::new());
    let (_s, c) = connect(&server, &client);

    let err = c.call(TIMEOUT, "explode").await.unwrap_err();
    assert!(matches!(err, RpcError::InvocationFailed));

    let mut out = 0i64;
    c.call_in_out(TIMEOUT, "add_one", 41i64, &mut out).await.unwrap();
    assert_eq!(out, 42);
}

#[tokio::test]
async fn test_concurrent_calls_match_their_responses() {
    let (server, client) = (server_core(), Core::new());
    let (_s, c) = connect(&server, &client);

    let calls = (0..50i64).map(|i| {
        let c = c.clone();
        async move {
            let mut out = 0i64;
            c.call_in_out(TIMEOUT, "add_one", i, &mut out).await?;
            Ok::<_, RpcError>((i, out))
        }
    });

    for result in futures::future::join_all(calls).await {
        let (i, out) = result.unwrap();
        assert_eq!(out, i + 1);
    }
    assert!(client.promises().is_empty());
}

#[tokio::test]
async fn test_timeout_removes_pending_call() {
    let (server, client) = (server_core(), Core::new());
    let (_s, c) = connect(&server, &client);

    let err = c.call(Duration::from_millis(100), "slow").await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout));
    assert_eq!(client.promises().len(), 0);
}

#[tokio::test]
async fn test_close_fails_pending_and_later_calls() {
    let (server, client) = (server_core(), Core::new());
    let (_s, c) = connect(&server, &client);

    let (pending, ()) = tokio::join!(c.call(Duration::from_secs(10), "slow"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.close().unwrap();
    });
    assert!(matches!(pending.unwrap_err(), RpcError::ConnectionClosed));

    let err = c.call(TIMEOUT, "slow").await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed));
    assert!(client.promises().is_empty());
}

#[tokio::test]
async fn test_middleware_runs_first_registered_outermost() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = Core::new();
    server.use_middleware([record(log.clone(), "A"), record(log.clone(), "B")]);

    let handler_log = log.clone();
    server
        .register_with_name(
            "work",
            Function::new(move |_ctx: RequestContext| {
                let log = handler_log.clone();
                async move {
                    log.lock().unwrap().push("H".to_string());
                    Ok(())
                }
            }),
            &[],
        )
        .unwrap();

    let client = Core::new();
    let (_s, c) = connect(&server, &client);
    c.call(TIMEOUT, "work").await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["A-in", "B-in", "H", "B-out", "A-out"]
    );
}

#[tokio::test]
async fn test_per_call_middleware_replaces_callable_chain() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (server, client) = (server_core(), Core::new());
    let (_s, c) = connect(&server, &client);

    c.use_middleware([record(log.clone(), "own")]);
    let mut out = 0i64;
    c.call_with(TIMEOUT, "add_one", Some(1i64), Some(&mut out), &[record(log.clone(), "call")])
        .await
        .unwrap();
    assert_eq!(out, 2);
    assert_eq!(*log.lock().unwrap(), vec!["call-in", "call-out"]);

    log.lock().unwrap().clear();
    c.call_in(TIMEOUT, "add_one", 1i64).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["own-in", "own-out"]);
}

#[tokio::test]
async fn test_headers_round_trip() {
    let server = Core::new();
    server
        .register_with_name(
            "ping",
            Function::new(|_ctx: RequestContext| async { Ok(()) }),
            &[],
        )
        .unwrap();
    // Copy the "trace" request header onto the response.
    server.use_middleware([middleware_fn(|next: HandleFunc| {
        handle_fn(move |ctx| {
            let next = next.clone();
            Box::pin(async move {
                next(&mut *ctx).await;
                if let Some(trace) = ctx.request_header().and_then(|h| h.get("trace")).cloned() {
                    let mut headers = Headers::new();
                    headers.insert("trace".to_string(), trace);
                    ctx.set_response_header(headers);
                }
            })
        })
    })]);

    let client = Core::new();
    let (_s, c) = connect(&server, &client);

    let mut headers = Headers::new();
    headers.insert("trace".to_string(), "abc".to_string());
    let response = c.call_with_headers(TIMEOUT, "ping", headers).await.unwrap();
    assert_eq!(response.get("trace").map(String::as_str), Some("abc"));
}

#[tokio::test]
async fn test_handler_calls_back_over_the_same_connection() {
    let server = Core::new();
    server
        .register_with_name(
            "greet",
            Function::with_output(|ctx: RequestContext| async move {
                let callable = ctx.callable().cloned().ok_or(RpcError::ConnectionClosed)?;
                let mut name = String::new();
                callable.call_out(TIMEOUT, "name", &mut name).await?;
                Ok::<_, RpcError>(format!("hello {}", name))
            }),
            &[],
        )
        .unwrap();

    let client = Core::new();
    client
        .register_with_name(
            "name",
            Function::with_output(|_ctx: RequestContext| async { Ok("bob".to_string()) }),
            &[],
        )
        .unwrap();

    let (_s, c) = connect(&server, &client);
    let mut out = String::new();
    c.call_out(TIMEOUT, "greet", &mut out).await.unwrap();
    assert_eq!(out, "hello bob");
}

#[tokio::test]
async fn test_virtual_callables_bridged_by_channels() {
    let server = server_core();
    let client = Core::new();
    server.start();
    client.start();

    let (server_writer, mut from_server) = ChannelWriter::new();
    let (client_writer, mut from_client) = ChannelWriter::new();
    let server_side = Callable::new_virtual(&server, server_writer);
    let client_side = Callable::new_virtual(&client, client_writer);
    server_side.start();
    client_side.start();

    let to_server = server_side.clone();
    tokio::spawn(async move {
        while let Some(frame) = from_client.recv().await {
            if to_server.mock_read_data(frame).await.is_err() {
                break;
            }
        }
    });
    let to_client = client_side.clone();
    tokio::spawn(async move {
        while let Some(frame) = from_server.recv().await {
            if to_client.mock_read_data(frame).await.is_err() {
                break;
            }
        }
    });

    let mut out = String::new();
    client_side
        .call_in_out(TIMEOUT, "echo", "over the bridge".to_string(), &mut out)
        .await
        .unwrap();
    assert_eq!(out, "over the bridge");
}

#[tokio::test]
async fn test_middleware_can_redirect_the_response() {
    let (capture, mut captured) = ChannelWriter::new();
    let server = server_core();
    server.pre_use([middleware_fn(move |next: HandleFunc| {
        let capture = capture.clone();
        handle_fn(move |ctx| {
            let next = next.clone();
            let capture = capture.clone();
            Box::pin(async move {
                ctx.set_writer(Some(Arc::new(capture)));
                next(&mut *ctx).await;
            })
        })
    })]);

    let client = Core::new();
    let (_s, c) = connect(&server, &client);

    // The response goes to the capture writer, so the caller never sees it.
    let err = c
        .call_in(Duration::from_millis(200), "echo", "hidden".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    let frame = captured.recv().await.unwrap();
    let response = FrameBuffer::new().push(&frame).remove(0);
    assert!(response.is_response());
    assert_eq!(response.bind_data::<String>().unwrap(), "hidden");
}

#[tokio::test]
async fn test_time_wheel_closes_idle_callable() {
    let server = server_core();
    let client = Core::new();

    let (a, b) = tokio::io::duplex(4096);
    let server_side = SignalCallable::new(Callable::from_stream(&server, a));
    let client_side = SignalCallable::new(Callable::from_stream(&client, b));

    let wheel = TimeWheel::new(Duration::from_millis(20), 2);
    wheel.start();
    server_side.bind_time_wheel(wheel.clone());

    server.start();
    client.start();
    server_side.start();
    client_side.start();

    tokio::time::timeout(TIMEOUT, server_side.closed())
        .await
        .unwrap()
        .unwrap();
    assert!(server_side.is_closed());

    // The peer sees end of stream.
    tokio::time::timeout(TIMEOUT, client_side.closed())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_signal_callable_ready_and_closed() {
    let (server, client) = (server_core(), Core::new());
    server.start();
    client.start();

    let (a, b) = tokio::io::duplex(4096);
    let server_side = Callable::from_stream(&server, a);
    let client_side = SignalCallable::new(Callable::from_stream(&client, b));
    server_side.start();
    client_side.start();

    client_side.ready().await.unwrap();
    server_side.close().unwrap();
    tokio::time::timeout(TIMEOUT, client_side.closed())
        .await
        .unwrap()
        .unwrap();
    assert!(client_side.is_closed());
}

#[tokio::test]
async fn test_frames_split_across_reads() {
    let server = server_core();
    server.start();

    let (writer, mut responses) = ChannelWriter::new();
    let callable = Callable::new_virtual(&server, writer);
    callable.start();

    let mut request = callwire::Message::request("add_one", None);
    request.set_data(&9i64).unwrap();
    let frame = callwire::protocol::encode_message(&request).unwrap();

    for chunk in frame.chunks(3) {
        callable.mock_read_data(chunk.to_vec()).await.unwrap();
    }

    let frame = responses.recv().await.unwrap();
    let response = FrameBuffer::new().push(&frame).remove(0);
    assert_eq!(response.id, request.id);
    assert_eq!(response.bind_data::<i64>().unwrap(), 10);
}

#[tokio::test]
async fn test_pre_use_sees_function_not_found() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = server_core();
    let observed = seen.clone();
    server.pre_use([middleware_fn(move |next: HandleFunc| {
        let observed = observed.clone();
        handle_fn(move |ctx| {
            let next = next.clone();
            let observed = observed.clone();
            Box::pin(async move {
                next(&mut *ctx).await;
                let error = ctx.error().map(ToString::to_string).unwrap_or_default();
                observed.lock().unwrap().push((ctx.method().to_string(), error));
            })
        })
    })]);

    let client = Core::new();
    let (_s, c) = connect(&server, &client);

    let err = c.call(TIMEOUT, "unregistered").await.unwrap_err();
    assert!(matches!(err, RpcError::FunctionNotFound));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(
            "unregistered".to_string(),
            RpcError::FunctionNotFound.to_string()
        )]
    );
}

#[tokio::test]
async fn test_request_not_nil_as_pre_use() {
    let server = server_core();
    server.pre_use([request_not_nil()]);

    let client = Core::new();
    let (_s, c) = connect(&server, &client);

    // add_one declares an input; calling it without one is rejected up front.
    let err = c.call(TIMEOUT, "add_one").await.unwrap_err();
    assert_eq!(err.to_string(), REQUEST_NIL);

    let mut out = 0i64;
    c.call_in_out(TIMEOUT, "add_one", 1i64, &mut out).await.unwrap();
    assert_eq!(out, 2);
}

#[tokio::test]
async fn test_pre_use_can_rewrite_the_method() {
    let server = server_core();
    server.pre_use([middleware_fn(|next: HandleFunc| {
        handle_fn(move |ctx| {
            let next = next.clone();
            Box::pin(async move {
                if ctx.method() == "increment" {
                    ctx.set_method("add_one");
                }
                next(&mut *ctx).await;
            })
        })
    })]);

    let client = Core::new();
    let (_s, c) = connect(&server, &client);

    let mut out = 0i64;
    c.call_in_out(TIMEOUT, "increment", 9i64, &mut out).await.unwrap();
    assert_eq!(out, 10);
}

#[tokio::test]
async fn test_output_type_needs_only_deserialize() {
    #[derive(serde::Deserialize)]
    #[serde(transparent)]
    struct Reply {
        text: String,
    }

    let (server, client) = (server_core(), Core::new());
    let (_s, c) = connect(&server, &client);

    let mut out = Reply {
        text: String::new(),
    };
    c.call_in_out(TIMEOUT, "echo", "typed".to_string(), &mut out)
        .await
        .unwrap();
    assert_eq!(out.text, "typed");
}

#[tokio::test]
async fn test_mq_relays_responses_of_tagged_calls() {
    use callwire::middleware::{mq_headers, Mq};

    let server = server_core();
    let (tx, mut published) = tokio::sync::mpsc::unbounded_channel();
    let mq = Mq::new(&server, move |target: &str, reply: &str, frame: bytes::Bytes| {
        let _ = tx.send((target.to_string(), reply.to_string(), frame));
    });
    server.use_middleware([mq.middleware()]);

    let client = Core::new();
    let (_s, c) = connect(&server, &client);

    // Tagged: the answer goes to the broker, not back over the connection.
    let err = c
        .call_full::<String, String>(
            Duration::from_millis(200),
            "echo",
            Some(mq_headers("abc", "xyz")),
            Some("via mq".to_string()),
            None,
            &[],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    let (target, reply, frame) = published.recv().await.unwrap();
    assert_eq!((target.as_str(), reply.as_str()), ("abc", "xyz"));
    let response = FrameBuffer::new().push(&frame).remove(0);
    assert_eq!(response.bind_data::<String>().unwrap(), "via mq");

    // Untagged calls are answered as usual.
    let mut out = String::new();
    c.call_in_out(TIMEOUT, "echo", "direct".to_string(), &mut out)
        .await
        .unwrap();
    assert_eq!(out, "direct");
}
