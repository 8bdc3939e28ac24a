//! # rpcwire
//!
//! Wire protocol and streaming engine for a multiplexed RPC framework.
//!
//! Every message travels in a frame with a 16-byte big-endian header. Unary
//! calls pair one request frame with one response frame by request ID.
//! Streams open with INIT, carry DATA both ways, end with CLOSE, and are
//! paced by FEEDBACK frames under credit-based flow control. Any number of
//! unary calls and streams share one connection.
//!
//! ## Layers
//!
//! - [`protocol`] - frame header, framer, envelopes
//! - [`unary`] - unary request/response codec
//! - [`stream`] - stream frame codec, flow control, client and server streams
//! - [`codec`] - payload serialization and compression by type code
//! - [`transport`] / [`writer`] - connection read and write tasks
//! - [`Client`] / [`Server`] - builders tying the above together
//!
//! Dialing and accepting connections is left to the caller: anything that
//! implements `AsyncRead` + `AsyncWrite` works.
//!
//! ## Example
//!
//! ```ignore
//! use rpcwire::{CallContext, Client, Server, StreamDesc};
//!
//! let server = Server::builder()
//!     .stream("/pkg.Echo/Chat", |mut stream| async move {
//!         while let Some(body) = stream.recv_bytes().await? {
//!             stream.send_bytes(body).await?;
//!         }
//!         Ok(())
//!     })
//!     .build();
//! tokio::spawn(async move { server.serve_connection(sread, swrite, "peer").await });
//!
//! let client = Client::builder().connect(cread, cwrite);
//! let mut ctx = CallContext::new("/pkg.Echo/Chat");
//! let stream = client.new_stream(&mut ctx, &StreamDesc::bidi("/pkg.Echo/Chat")).await?;
//! stream.send_bytes("hello".into()).await?;
//! stream.close_send().await?;
//! while let Some(body) = stream.recv_bytes().await? {
//!     println!("{body:?}");
//! }
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod unary;
pub mod writer;

mod client;
mod server;

pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use context::{CallContext, ContextPool, DoneSignal, PooledContext};
pub use error::{ErrorKind, Result, RpcError, RpcwireError};
pub use server::{Server, ServerBuilder};
pub use stream::{ClientStream, ServerStream, StreamDesc, StreamInterceptor};
