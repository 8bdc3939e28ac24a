//! Unary calls over TCP: a typed echo, a business error and a missing method.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use rpcwire::{CallContext, Client, RpcError, RpcwireError, Server};

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    name: String,
    times: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = Server::builder()
        .unary("/demo.Greeter/Greet", |info, req: Greeting| async move {
            if req.times == 0 {
                return Err(RpcwireError::from(RpcError::business(1, "times must be positive")));
            }
            let greeting = format!("hello {}! ", req.name).repeat(req.times as usize);
            Ok(format!("{}(from {})", greeting, info.caller))
        })
        .build();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((socket, peer)) = listener.accept().await {
            let server = server.clone();
            tokio::spawn(async move {
                let (read, write) = socket.into_split();
                let _ = server.serve_connection(read, write, peer.to_string()).await;
            });
        }
    });

    let (read, write) = TcpStream::connect(addr).await?.into_split();
    let client = Client::builder().caller("demo.client").connect(read, write);

    let mut ctx = CallContext::new("/demo.Greeter/Greet").with_timeout(Duration::from_secs(1));
    let reply: String = client
        .invoke(&mut ctx, &Greeting { name: "rpcwire".into(), times: 2 })
        .await?;
    println!("{reply}");

    let mut ctx = CallContext::new("/demo.Greeter/Greet");
    match client
        .invoke::<_, String>(&mut ctx, &Greeting { name: "nobody".into(), times: 0 })
        .await
    {
        Ok(reply) => println!("unexpected reply: {reply}"),
        Err(e) => println!("business error: {e}"),
    }

    let mut ctx = CallContext::new("/demo.Greeter/Missing");
    if let Err(e) = client.invoke::<_, String>(&mut ctx, &()).await {
        println!("framework error: {e}");
    }
    Ok(())
}
