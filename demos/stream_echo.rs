//! Bidirectional stream echo over TCP.
//!
//! Run with `RUST_LOG=rpcwire=debug cargo run --example stream_echo` to see
//! the stream lifecycle.

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use rpcwire::{CallContext, Client, Server, ServerStream, StreamDesc};

const METHOD: &str = "/demo.Echo/Chat";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = Server::builder()
        .stream(METHOD, |mut stream: ServerStream| async move {
            while let Some(body) = stream.recv_bytes().await? {
                let mut reply = b"echo: ".to_vec();
                reply.extend_from_slice(&body);
                stream.send_bytes(Bytes::from(reply)).await?;
            }
            Ok(())
        })
        .build();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((socket, peer)) = listener.accept().await {
            let server = server.clone();
            tokio::spawn(async move {
                let (read, write) = socket.into_split();
                if let Err(e) = server.serve_connection(read, write, peer.to_string()).await {
                    tracing::error!("connection {} ended: {}", peer, e);
                }
            });
        }
    });

    let (read, write) = TcpStream::connect(addr).await?.into_split();
    let client = Client::builder().caller("demo.client").connect(read, write);

    let mut ctx = CallContext::new(METHOD);
    let stream = client.new_stream(&mut ctx, &StreamDesc::bidi(METHOD)).await?;
    for word in ["alpha", "beta", "gamma"] {
        stream.send_bytes(Bytes::from(word)).await?;
        if let Some(reply) = stream.recv_bytes().await? {
            println!("{}", String::from_utf8_lossy(&reply));
        }
    }
    stream.close_send().await?;
    while stream.recv_bytes().await?.is_some() {}
    println!("stream {} closed", stream.stream_id());
    Ok(())
}
