//! Integration tests for rpcwire.
//!
//! Client and server run on the two ends of an in-memory duplex pipe.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rpcwire::error::codes;
use rpcwire::protocol::{construct, FrameHeader, StreamFrameType, HEADER_SIZE};
use rpcwire::{
    CallContext, Client, ClientBuilder, Config, ErrorKind, RpcError, RpcwireError, Server,
    ServerStream, StreamDesc,
};

const METHOD: &str = "/pkg.Service/Method";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn connect(
    server: &Server,
    client: ClientBuilder,
    addr: &str,
) -> (Client, JoinHandle<rpcwire::Result<()>>) {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let (sread, swrite) = tokio::io::split(server_io);
    let server = server.clone();
    let addr = addr.to_string();
    let serving = tokio::spawn(async move { server.serve_connection(sread, swrite, addr).await });
    let (cread, cwrite) = tokio::io::split(client_io);
    (client.connect(cread, cwrite), serving)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_stream_ping_pong_without_flow_control() {
    let server = Server::builder()
        .stream(METHOD, |mut stream: ServerStream| async move {
            while let Some(body) = stream.recv_bytes().await? {
                assert_eq!(&body[..], b"hello");
                stream.send_bytes(Bytes::from_static(b"pong")).await?;
            }
            Ok(())
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder().initial_window_size(0), "peer:1");

    let mut ctx = CallContext::new(METHOD);
    let stream = client
        .new_stream(&mut ctx, &StreamDesc::bidi(METHOD))
        .await
        .unwrap();
    assert_eq!(stream.stream_id(), 100);
    assert_eq!(server.active_streams("peer:1"), 1);

    stream.send_bytes(Bytes::from_static(b"hello")).await.unwrap();
    let reply = stream.recv_bytes().await.unwrap().unwrap();
    assert_eq!(&reply[..], b"pong");

    stream.close_send().await.unwrap();
    assert_eq!(stream.recv_bytes().await.unwrap(), None);
    assert_eq!(stream.recv_bytes().await.unwrap(), None);

    eventually(|| server.active_streams("peer:1") == 0).await;
    eventually(|| stream.is_closed()).await;
}

#[tokio::test]
async fn test_handler_error_resets_stream() {
    let server = Server::builder()
        .stream(METHOD, |mut stream: ServerStream| async move {
            stream.recv_bytes().await?;
            Err(RpcError::business(4001, "not allowed").into())
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:2");

    let mut ctx = CallContext::new(METHOD);
    let stream = client
        .new_stream(&mut ctx, &StreamDesc::bidi(METHOD))
        .await
        .unwrap();
    stream.send_bytes(Bytes::from_static(b"x")).await.unwrap();

    let err = stream.recv_bytes().await.unwrap_err();
    let rpc = err.as_rpc().unwrap();
    assert_eq!(rpc.kind, ErrorKind::Business);
    assert_eq!(rpc.code, 4001);
    assert_eq!(rpc.msg, "not allowed");

    eventually(|| stream.is_closed()).await;
    assert!(stream.send_bytes(Bytes::from_static(b"y")).await.is_err());
    eventually(|| server.active_streams("peer:2") == 0).await;
}

#[tokio::test]
async fn test_unknown_stream_method() {
    let server = Server::builder().build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:3");

    let mut ctx = CallContext::new("/pkg.Service/Missing");
    let err = client
        .new_stream(&mut ctx, &StreamDesc::bidi("/pkg.Service/Missing"))
        .await
        .err()
        .unwrap();
    let rpc = err.as_rpc().unwrap();
    assert_eq!(rpc.kind, ErrorKind::CalleeFramework);
    assert_eq!(rpc.code, codes::SERVER_NO_FUNC);
    assert_eq!(server.active_streams("peer:3"), 0);
}

#[tokio::test]
async fn test_flow_controlled_bulk_transfer() {
    const CHUNKS: usize = 40;
    const CHUNK: usize = 32 * 1024;

    let server = Server::builder()
        .stream(METHOD, |mut stream: ServerStream| async move {
            let mut n = 0u32;
            while let Some(body) = stream.recv_bytes().await? {
                assert_eq!(body.len(), CHUNK);
                assert!(body.iter().all(|&b| b == n as u8));
                n += 1;
            }
            stream.send_msg(&n).await?;
            Ok(())
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:4");

    let mut ctx = CallContext::new(METHOD);
    let stream = client
        .new_stream(&mut ctx, &StreamDesc::client_streaming(METHOD))
        .await
        .unwrap();
    // 40 * 32 KiB is far beyond the 64 KiB window, so this only finishes if
    // the server keeps granting credit back.
    for i in 0..CHUNKS {
        stream
            .send_bytes(Bytes::from(vec![i as u8; CHUNK]))
            .await
            .unwrap();
    }
    stream.close_send().await.unwrap();

    let count: u32 = stream.recv_msg().await.unwrap().unwrap();
    assert_eq!(count as usize, CHUNKS);
    assert_eq!(stream.recv_bytes().await.unwrap(), None);
}

#[tokio::test]
async fn test_server_streaming_with_concurrent_unary() {
    let server = Server::builder()
        .unary("/pkg.Service/Add", |_info, (a, b): (i64, i64)| async move { Ok(a + b) })
        .stream("/pkg.Service/Count", |mut stream: ServerStream| async move {
            let upto: u32 = stream.recv_msg().await?.unwrap_or(0);
            for i in 0..upto {
                stream.send_msg(&i).await?;
            }
            Ok(())
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:5");
    let client = Arc::new(client);

    let mut ctx = CallContext::new("/pkg.Service/Count");
    let stream = client
        .new_stream(&mut ctx, &StreamDesc::server_streaming("/pkg.Service/Count"))
        .await
        .unwrap();
    stream.send_msg(&50u32).await.unwrap();
    stream.close_send().await.unwrap();

    let adder = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut sum = 0;
            for i in 0..20i64 {
                let mut ctx = CallContext::new("/pkg.Service/Add");
                sum += client.invoke::<_, i64>(&mut ctx, &(i, 1i64)).await.unwrap();
            }
            sum
        })
    };

    let mut seen = Vec::new();
    while let Some(n) = stream.recv_msg::<u32>().await.unwrap() {
        seen.push(n);
    }
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
    assert_eq!(adder.await.unwrap(), (0..20).sum::<i64>() + 20);
}

#[tokio::test]
async fn test_server_streams_many_windows_after_half_close() {
    const CHUNK: usize = 32 * 1024;
    const CHUNKS: u32 = 32;

    let server = Server::builder()
        .stream("/pkg.Service/Download", |mut stream: ServerStream| async move {
            let chunks: u32 = stream.recv_msg().await?.unwrap_or(0);
            for i in 0..chunks {
                stream.send_bytes(Bytes::from(vec![i as u8; CHUNK])).await?;
            }
            Ok(())
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:13");

    let mut ctx = CallContext::new("/pkg.Service/Download");
    let stream = client
        .new_stream(&mut ctx, &StreamDesc::server_streaming("/pkg.Service/Download"))
        .await
        .unwrap();
    stream.send_msg(&CHUNKS).await.unwrap();
    stream.close_send().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        let mut received = Vec::new();
        while let Some(body) = stream.recv_bytes().await.unwrap() {
            assert_eq!(body.len(), CHUNK);
            received.push(body[0]);
        }
        received
    })
    .await
    .expect("server stalled after the client half-closed");

    assert_eq!(received.len() * CHUNK, 1 << 20);
    assert_eq!(received, (0..CHUNKS).map(|i| i as u8).collect::<Vec<_>>());
    assert_eq!(stream.recv_bytes().await.unwrap(), None);
    eventually(|| server.active_streams("peer:13") == 0).await;
}

#[tokio::test]
async fn test_inflating_request_is_rejected_as_decode_fail() {
    let server = Server::builder()
        .max_frame_size(1 << 20)
        .unary_raw("/pkg.Service/Sink", |_info, body: Bytes| async move { Ok(body) })
        .build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:14");

    let mut ctx = CallContext::new("/pkg.Service/Sink");
    ctx.compress_type = rpcwire::codec::COMPRESS_GZIP;
    let err = client
        .invoke_raw(&mut ctx, Bytes::from(vec![0u8; 4 << 20]))
        .await
        .unwrap_err();
    let err = err.as_rpc().cloned().unwrap();
    assert_eq!(err.kind, ErrorKind::CalleeFramework);
    assert_eq!(err.code, codes::SERVER_DECODE_FAIL);

    let mut ctx = CallContext::new("/pkg.Service/Sink");
    ctx.compress_type = rpcwire::codec::COMPRESS_GZIP;
    let small = client
        .invoke_raw(&mut ctx, Bytes::from(vec![0u8; 64 * 1024]))
        .await
        .unwrap();
    assert_eq!(small.len(), 64 * 1024);
}

#[tokio::test]
async fn test_unary_business_and_framework_errors() {
    let server = Server::builder()
        .unary("/pkg.Service/Check", |_info, n: i32| async move {
            if n < 0 {
                return Err(RpcError::business(12, "negative").into());
            }
            Ok(n)
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:6");

    let mut ctx = CallContext::new("/pkg.Service/Check");
    assert_eq!(client.invoke::<_, i32>(&mut ctx, &5).await.unwrap(), 5);

    let mut ctx = CallContext::new("/pkg.Service/Check");
    let err = client.invoke::<_, i32>(&mut ctx, &-1).await.unwrap_err();
    assert_eq!(err.as_rpc(), Some(&RpcError::business(12, "negative")));
    assert_eq!(ctx.error, Some(RpcError::business(12, "negative")));

    let mut ctx = CallContext::new("/pkg.Service/Nope");
    let err = client.invoke::<_, i32>(&mut ctx, &1).await.unwrap_err();
    let rpc = err.as_rpc().unwrap();
    assert_eq!(rpc.kind, ErrorKind::CalleeFramework);
    assert_eq!(rpc.code, codes::SERVER_NO_FUNC);
}

#[tokio::test]
async fn test_oversized_unary_response_becomes_encode_fail() {
    let mut config = Config::default();
    config.max_frame_size = 4096;
    let server = Server::builder()
        .config(config)
        .unary_raw("/pkg.Service/Big", |_info, _body| async move {
            Ok(Bytes::from(vec![b'x'; 8192]))
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:7");

    let mut ctx = CallContext::new("/pkg.Service/Big");
    let err = client.invoke_raw(&mut ctx, Bytes::new()).await.unwrap_err();
    let rpc = err.as_rpc().unwrap();
    assert_eq!(rpc.code, codes::SERVER_ENCODE_FAIL);
    assert_eq!(rpc.kind, ErrorKind::CalleeFramework);
}

#[tokio::test]
async fn test_connection_loss_resets_every_server_stream() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let server = Server::builder()
        .stream(METHOD, move |mut stream: ServerStream| {
            let seen = seen_tx.clone();
            async move {
                let err = stream.recv_bytes().await.unwrap_err();
                let _ = seen.send(err.as_rpc().map(|e| e.code));
                Ok(())
            }
        })
        .build();
    let (client, serving) = connect(&server, Client::builder(), "peer:8");

    let mut streams = Vec::new();
    for _ in 0..3 {
        let mut ctx = CallContext::new(METHOD);
        streams.push(
            client
                .new_stream(&mut ctx, &StreamDesc::bidi(METHOD))
                .await
                .unwrap(),
        );
    }
    assert_eq!(server.active_streams("peer:8"), 3);

    drop(streams);
    drop(client);
    serving.await.unwrap().unwrap();

    for _ in 0..3 {
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            Some(codes::STREAM_SERVER_NETWORK_ERR)
        );
    }
    assert_eq!(server.active_streams("peer:8"), 0);
}

#[tokio::test]
async fn test_client_deadline_during_stream_receive() {
    let server = Server::builder()
        .stream(METHOD, |mut stream: ServerStream| async move {
            while stream.recv_bytes().await?.is_some() {}
            Ok(())
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder(), "peer:9");

    let mut ctx = CallContext::new(METHOD).with_timeout(Duration::from_millis(50));
    let stream = client
        .new_stream(&mut ctx, &StreamDesc::bidi(METHOD))
        .await
        .unwrap();
    let err = stream.recv_bytes().await.unwrap_err();
    let rpc = err.as_rpc().unwrap();
    assert_eq!(rpc.code, codes::CLIENT_INVOKE_TIMEOUT);
    assert!(rpc.is_timeout());
}

#[tokio::test]
async fn test_config_from_json_drives_windows() {
    let config = Config::from_json_str(
        r#"{ "stream": { "initial_window_size": 0 }, "max_concurrent_handlers": 4 }"#,
    )
    .unwrap();
    assert_eq!(config.stream.initial_window_size, 0);
    assert_eq!(config.max_concurrent_handlers, 4);

    let server = Server::builder()
        .stream(METHOD, |mut stream: ServerStream| async move {
            while let Some(body) = stream.recv_bytes().await? {
                stream.send_bytes(body).await?;
            }
            Ok(())
        })
        .build();
    let (client, _serving) = connect(&server, Client::builder().config(config), "peer:10");

    let mut ctx = CallContext::new(METHOD);
    let stream = client
        .new_stream(&mut ctx, &StreamDesc::bidi(METHOD))
        .await
        .unwrap();
    // Flow control is off, so sends never wait for credit.
    for _ in 0..8 {
        stream
            .send_bytes(Bytes::from(vec![1u8; 60_000]))
            .await
            .unwrap();
    }
    stream.close_send().await.unwrap();
    let mut total = 0;
    while let Some(body) = stream.recv_bytes().await.unwrap() {
        total += body.len();
    }
    assert_eq!(total, 8 * 60_000);
}

#[test]
fn test_stream_closed_error_text() {
    assert_eq!(RpcwireError::StreamClosed.to_string(), "stream is already closed");
}

proptest! {
    #[test]
    fn prop_frame_length_is_sum_of_parts(
        env in 0usize..2048,
        body in 0usize..8192,
        att in 0usize..1024,
        id in any::<u32>(),
    ) {
        let header = FrameHeader::stream(StreamFrameType::Data, id);
        let frame = construct(&header, &vec![1u8; env], &vec![2u8; body], &vec![3u8; att], 1 << 20)
            .unwrap();
        prop_assert_eq!(frame.len(), HEADER_SIZE + env + body + att);

        let parsed = FrameHeader::extract(&frame).unwrap();
        prop_assert_eq!(parsed.total_len as usize, frame.len());
        prop_assert_eq!(parsed.header_len as usize, env);
        prop_assert_eq!(parsed.stream_id, id);
        prop_assert!(parsed.is_stream());
    }

    #[test]
    fn prop_oversized_frames_are_rejected(extra in 1usize..4096) {
        let max = 4096;
        let header = FrameHeader::unary(1);
        let body = vec![0u8; max - HEADER_SIZE + extra];
        prop_assert!(construct(&header, b"", &body, b"", max).is_err());
    }
}
