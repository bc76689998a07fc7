//! Pipelined http/1 server connection dispatching over any byte stream.
//!
//! [ServerConnection] owns one accepted client connection: it parses
//! pipelined requests, hands each one to the application through a
//! [Dispatcher] as an independent [DispatchContext], and serialises the
//! responses back onto the wire in request arrival order no matter in which
//! order the application finishes them. The application reads the request
//! body and writes the response through in memory [fake streams], so request
//! handling may run on any task or thread.
//!
//! # Examples
//! ```rust
//! # use http_dispatch::{Duplex, Error, ServerConnection};
//! # use tokio::io::AsyncWriteExt;
//! # async fn example() -> Result<(), Error> {
//! # let (mut client, socket) = Duplex::pair();
//! // socket is anything AsyncRead + AsyncWrite, e.g. an accepted TcpStream.
//! let connection = ServerConnection::new(socket);
//! let dispatcher = connection.dispatcher();
//!
//! # client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
//! # client.shutdown().await.unwrap();
//! let serve = connection.run();
//! let app = async {
//!     while let Ok(mut ctx) = dispatcher.wait_dispatch().await {
//!         ctx.response().flush(b"hello")?;
//!     }
//!     Ok::<_, Error>(())
//! };
//! let (served, _) = tokio::join!(serve, app);
//! served
//! # }
//! ```
//!
//! [fake streams]: crate::FakeStream

#![forbid(unsafe_code)]

mod connection;
mod dispatch;
mod request;
mod responder;
mod response;

pub mod api;
pub mod error;
pub mod fake_stream;
pub mod header;
pub mod proto;
pub mod stream;

pub use self::connection::{Dispatcher, ServerConnection};
pub use self::dispatch::{DispatchContext, Request};
pub use self::error::Error;
pub use self::fake_stream::{Duplex, FakeStream, ReadStream};
pub use self::request::{ConnectionId, RequestContext, RequestId};
pub use self::response::{ContentLength, Response, ResponseMode};
pub use self::stream::BoxedStream;
