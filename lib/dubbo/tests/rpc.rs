//! End-to-end tests against a scripted provider speaking raw frames over a
//! loopback listener.

use dubbo_client::{ClientConfig, ConnectionPool, DubboClient, DubboError, Value};
use hessian2::{Decoder, Encoder, Object};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn spawn_provider<F>(script: F) -> String
where
    F: FnOnce(TcpListener) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || script(listener));
    addr
}

fn accept(listener: &TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

/// Reads one frame: the 16-byte header plus its body.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<([u8; 16], Vec<u8>)> {
    let mut head = [0u8; 16];
    stream.read_exact(&mut head)?;
    let body_len = i32::from_be_bytes([head[12], head[13], head[14], head[15]]) as usize;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body)?;
    Ok((head, body))
}

fn response_frame(id_bytes: &[u8], status: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![0xda, 0xbb, 0x02, status];
    frame.extend_from_slice(id_bytes);
    frame.extend_from_slice(&(body.len() as i32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

fn ok_body(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_int(1);
    encoder.write_value(value);
    encoder.into_bytes().to_vec()
}

fn null_body() -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_int(2);
    encoder.into_bytes().to_vec()
}

/// Decodes the fixed request-body prefix:
/// (dubbo_version, path, version, method, parameter types).
fn read_preamble(decoder: &mut Decoder) -> (String, String, String, String, String) {
    (
        decoder.read_string().unwrap(),
        decoder.read_string().unwrap(),
        decoder.read_string().unwrap(),
        decoder.read_string().unwrap(),
        decoder.read_string().unwrap(),
    )
}

fn client_for(addr: &str, config: ClientConfig) -> (Arc<ConnectionPool>, DubboClient) {
    let pool = Arc::new(ConnectionPool::new(config).unwrap());
    let client = DubboClient::direct(
        "me.hourui.echo.provider.Echo",
        addr.to_string(),
        pool.clone(),
        None,
    );
    (pool, client)
}

#[test]
fn test_echo_primitives() {
    let (seen_tx, seen_rx) = mpsc::channel();
    let addr = spawn_provider(move |listener| {
        let mut stream = accept(&listener);
        let (head, body) = read_frame(&mut stream).unwrap();
        seen_tx.send((head, body)).unwrap();
        let frame = response_frame(&head[4..12], 20, &ok_body(&Value::from("ok")));
        stream.write_all(&frame).unwrap();
    });

    let (_pool, client) = client_for(&addr, ClientConfig::default());
    let result = client
        .call(
            "echo",
            vec![
                Value::from("Zhang"),
                Value::from("San"),
                Value::Int(19),
                Value::Double(2000.0),
                Value::Bool(true),
            ],
            Some(Duration::from_secs(5)),
        )
        .unwrap();
    assert_eq!(result, Value::from("ok"));

    let (head, body) = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Frame header: magic, request flags, blank status, then the first
    // invocation id of a fresh pool.
    assert_eq!(&head[..4], &[0xda, 0xbb, 0xc2, 0x00]);
    assert_eq!(&head[4..12], &[0, 0, 0, 0, 0, 0, 0, 1]);

    let mut decoder = Decoder::new(&body);
    let (dubbo_version, path, version, method, types) = read_preamble(&mut decoder);
    assert_eq!(dubbo_version, "2.4.10");
    assert_eq!(path, "me.hourui.echo.provider.Echo");
    assert_eq!(version, "1.0.0");
    assert_eq!(method, "echo");
    assert_eq!(types, "Ljava/lang/String;Ljava/lang/String;IDZ");
    assert_eq!(decoder.read_value().unwrap(), Value::from("Zhang"));
    assert_eq!(decoder.read_value().unwrap(), Value::from("San"));
    assert_eq!(decoder.read_value().unwrap(), Value::Int(19));
    assert_eq!(decoder.read_value().unwrap(), Value::Double(2000.0));
    assert_eq!(decoder.read_value().unwrap(), Value::Bool(true));
}

#[test]
fn test_null_flag_response() {
    let addr = spawn_provider(move |listener| {
        let mut stream = accept(&listener);
        let (head, _) = read_frame(&mut stream).unwrap();
        stream
            .write_all(&response_frame(&head[4..12], 20, &null_body()))
            .unwrap();
    });

    let (_pool, client) = client_for(&addr, ClientConfig::default());
    let result = client
        .call("echo8", vec![], Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(result, Value::Null);
}

#[test]
fn test_correlation_under_reordered_replies() {
    // The provider holds both requests, then answers them in reverse
    // order; each caller must still get its own argument back.
    let addr = spawn_provider(move |listener| {
        let mut stream = accept(&listener);
        let mut held = Vec::new();
        for _ in 0..2 {
            let (head, body) = read_frame(&mut stream).unwrap();
            let mut decoder = Decoder::new(&body);
            let _ = read_preamble(&mut decoder);
            let argument = decoder.read_value().unwrap();
            held.push((head, argument));
        }
        for (head, argument) in held.into_iter().rev() {
            stream
                .write_all(&response_frame(&head[4..12], 20, &ok_body(&argument)))
                .unwrap();
        }
    });

    let (pool, _) = client_for(&addr, ClientConfig::default());
    let mut workers = Vec::new();
    for value in [41, 42] {
        let pool = pool.clone();
        let addr = addr.clone();
        workers.push(thread::spawn(move || {
            let request = dubbo_client::RpcRequest {
                dubbo_version: "2.4.10".to_string(),
                path: "me.hourui.echo.provider.Echo".to_string(),
                version: "1.0.0".to_string(),
                method: "echo5".to_string(),
                arguments: vec![Value::Int(value)],
            };
            let result = pool
                .call(&addr, &request, Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(result, Value::Int(value));
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_timeout_then_late_response_is_discarded() {
    let addr = spawn_provider(move |listener| {
        let mut stream = accept(&listener);
        // First request: sit on it well past the caller's deadline.
        let (first_head, _) = read_frame(&mut stream).unwrap();
        thread::sleep(Duration::from_millis(600));
        stream
            .write_all(&response_frame(
                &first_head[4..12],
                20,
                &ok_body(&Value::from("late")),
            ))
            .unwrap();
        // Second request: answer promptly.
        let (second_head, _) = read_frame(&mut stream).unwrap();
        stream
            .write_all(&response_frame(
                &second_head[4..12],
                20,
                &ok_body(&Value::from("second")),
            ))
            .unwrap();
    });

    let (_pool, client) = client_for(&addr, ClientConfig::default());

    let started = Instant::now();
    let error = client
        .call("echo", vec![], Some(Duration::from_millis(300)))
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(error, DubboError::RequestTimeout { .. }), "{}", error);
    assert!(elapsed >= Duration::from_millis(250), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);

    // The late reply to the timed-out id must not leak into this call.
    let result = client
        .call("echo", vec![], Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(result, Value::from("second"));
}

#[test]
fn test_remote_application_error() {
    let addr = spawn_provider(move |listener| {
        let mut stream = accept(&listener);
        let (head, _) = read_frame(&mut stream).unwrap();

        let trace = Value::list(vec![Value::Object(
            Object::new("java.lang.StackTraceElement")
                .field("declaringClass", Value::from("me.hourui.echo.Echo"))
                .field("methodName", Value::from("echo17"))
                .field("fileName", Value::from("Echo.java"))
                .field("lineNumber", Value::Int(17)),
        )]);
        let exception = Value::Object(
            Object::new("java.lang.RuntimeException")
                .field("detailMessage", Value::from("This is broken"))
                .field("stackTrace", trace),
        );
        let mut encoder = Encoder::new();
        encoder.write_int(0);
        encoder.write_value(&exception);
        stream
            .write_all(&response_frame(&head[4..12], 20, &encoder.into_bytes()))
            .unwrap();
    });

    let (_pool, client) = client_for(&addr, ClientConfig::default());
    let error = client
        .call("echo17", vec![], Some(Duration::from_secs(5)))
        .unwrap_err();
    match error {
        DubboError::RemoteApplication(message) => {
            assert!(message.contains("This is broken"), "{}", message);
            assert!(message.contains("java.lang.RuntimeException"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_error_status_frame() {
    let addr = spawn_provider(move |listener| {
        let mut stream = accept(&listener);
        let (head, _) = read_frame(&mut stream).unwrap();

        let mut encoder = Encoder::new();
        encoder.write_string("no handler for echo99");
        stream
            .write_all(&response_frame(&head[4..12], 60, &encoder.into_bytes()))
            .unwrap();
    });

    let (_pool, client) = client_for(&addr, ClientConfig::default());
    let error = client
        .call("echo99", vec![], Some(Duration::from_secs(5)))
        .unwrap_err();
    match error {
        DubboError::RemoteResponse { status, message } => {
            assert_eq!(status, 60);
            assert_eq!(message, "no handler for echo99");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_pool_answers_provider_heartbeat() {
    let (probe_tx, probe_rx) = mpsc::channel();
    let addr = spawn_provider(move |listener| {
        let mut stream = accept(&listener);
        let (head, _) = read_frame(&mut stream).unwrap();
        stream
            .write_all(&response_frame(&head[4..12], 20, &ok_body(&Value::from("ok"))))
            .unwrap();

        // Probe the client and collect its heartbeat reply.
        let mut probe = vec![0xda, 0xbb, 0xe2, 0x00];
        probe.extend_from_slice(&7i64.to_be_bytes());
        probe.extend_from_slice(&0i32.to_be_bytes());
        stream.write_all(&probe).unwrap();

        let (reply_head, reply_body) = read_frame(&mut stream).unwrap();
        probe_tx.send((reply_head, reply_body)).unwrap();
    });

    let (_pool, client) = client_for(&addr, ClientConfig::default());
    client
        .call("echo", vec![], Some(Duration::from_secs(5)))
        .unwrap();

    let (head, body) = probe_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&head[..4], &[0xda, 0xbb, 0x22, 0x14]);
    assert_eq!(&head[4..12], &7i64.to_be_bytes());
    assert_eq!(body, b"N");
}

#[test]
fn test_heartbeat_reclamation_cycle() {
    let (count_tx, count_rx) = mpsc::channel();
    let (reconnect_tx, reconnect_rx) = mpsc::channel();
    let addr = spawn_provider(move |listener| {
        let mut stream = accept(&listener);
        let (head, _) = read_frame(&mut stream).unwrap();
        stream
            .write_all(&response_frame(&head[4..12], 20, &ok_body(&Value::from("ok"))))
            .unwrap();

        // Count heartbeat probes without answering until the client gives
        // up on the connection.
        let mut probes = 0u32;
        loop {
            match read_frame(&mut stream) {
                Ok((head, body)) => {
                    assert_eq!(&head[..4], &[0xda, 0xbb, 0xe2, 0x00]);
                    assert!(body.is_empty());
                    probes += 1;
                }
                Err(_) => break,
            }
        }
        count_tx.send(probes).unwrap();

        // The replacement connection arrives here.
        let _replacement = accept(&listener);
        reconnect_tx.send(()).unwrap();
    });

    let mut config = ClientConfig::default();
    config.idle_timeout_secs = 1;
    config.heartbeat_interval_ms = 30;
    config.heartbeat_max_misses = 3;
    let (_pool, client) = client_for(&addr, config);
    client
        .call("echo", vec![], Some(Duration::from_secs(5)))
        .unwrap();

    // Three unanswered probes, one per idle period, then reconnect.
    let probes = count_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(probes, 3);
    reconnect_rx.recv_timeout(Duration::from_secs(10)).unwrap();
}
