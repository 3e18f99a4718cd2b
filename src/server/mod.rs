//! Async TCP front end for a [`SpongeHandler`].
//!
//! Accepts connections, reads HTTP/1.1 requests (keep-alive by default), and
//! answers each one through [`SpongeHandler::serve`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::handler::SpongeHandler;
use crate::http::request::{Request, RequestError};
use crate::http::{Response, StatusCode};
use crate::proxy::Backend;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Largest request (head plus body) buffered before answering 413 (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// A bound listener waiting to serve a handler.
///
/// # Examples
///
/// ```rust,ignore
/// let handler = Arc::new(SpongeHandler::new(MyBackend, SpongeConfig::from_env()?)?);
/// let server = Server::bind("127.0.0.1:8081").await?;
/// server
///     .serve_with_shutdown(handler, async { tokio::signal::ctrl_c().await.ok(); })
///     .await?;
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `handler` until the process ends.
    pub async fn serve<B: Backend>(
        self,
        handler: Arc<SpongeHandler<B>>,
    ) -> Result<(), ServerError> {
        self.serve_with_shutdown(handler, std::future::pending()).await
    }

    /// Serves `handler` until `signal` resolves. Connections already accepted
    /// run to completion on their own tasks; the handler's background work
    /// is left to its owner.
    pub async fn serve_with_shutdown<B, S>(
        self,
        handler: Arc<SpongeHandler<B>>,
        signal: S,
    ) -> Result<(), ServerError>
    where
        B: Backend,
        S: Future<Output = ()> + Send,
    {
        info!(address = %self.local_addr, "sponge listening");
        tokio::pin!(signal);

        loop {
            let accepted = tokio::select! {
                _ = &mut signal => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer, "connection accepted");
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let connection = Connection::new(stream, peer);
                if let Err(e) = connection.run(handler).await {
                    warn!(peer = %peer, error = %e, "connection closed with error");
                }
            });
        }

        info!(address = %self.local_addr, "sponge stopped accepting connections");
        Ok(())
    }
}

// What the read side produced for one loop iteration.
enum Inbound {
    Request(Request),
    Reject(Response),
    Closed,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buf: BytesMut,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        }
    }

    async fn run<B: Backend>(mut self, handler: Arc<SpongeHandler<B>>) -> std::io::Result<()> {
        loop {
            let request = match self.next_request().await? {
                Inbound::Request(request) => request,
                Inbound::Reject(response) => {
                    self.write(response.keep_alive(false)).await?;
                    return Ok(());
                }
                Inbound::Closed => return Ok(()),
            };

            let keep_alive = request.is_keep_alive();
            debug!(
                peer = %self.peer,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            let response = handler.serve(request).await;
            self.write(response.keep_alive(keep_alive)).await?;

            if !keep_alive {
                debug!(peer = %self.peer, "client asked to close the connection");
                return Ok(());
            }
        }
    }

    // Reads until a full request (head and `Content-Length` body) is buffered,
    // then takes that frame off the front of the buffer. Pipelined bytes after
    // it stay for the next call.
    async fn next_request(&mut self) -> std::io::Result<Inbound> {
        loop {
            if !self.buf.is_empty() {
                match Request::parse(&self.buf) {
                    Ok((request, body_offset)) => {
                        let total = body_offset + request.content_length().unwrap_or(0);
                        if total > MAX_REQUEST_SIZE {
                            warn!(peer = %self.peer, "declared body too large, answering 413");
                            return Ok(Inbound::Reject(too_large()));
                        }
                        if self.buf.len() >= total {
                            let frame = self.buf.split_to(total).freeze();
                            let body = frame.slice(body_offset..);
                            return Ok(Inbound::Request(request.with_body(body)));
                        }
                    }
                    Err(RequestError::Incomplete) => {}
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "malformed request, answering 400");
                        let response = Response::new(StatusCode::BadRequest)
                            .body(format!("Bad Request: {e}"));
                        return Ok(Inbound::Reject(response));
                    }
                }
            }

            if self.buf.len() > MAX_REQUEST_SIZE {
                warn!(peer = %self.peer, "request too large, answering 413");
                return Ok(Inbound::Reject(too_large()));
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                debug!(peer = %self.peer, "connection closed by peer");
                return Ok(Inbound::Closed);
            }
        }
    }

    async fn write(&mut self, response: Response) -> std::io::Result<()> {
        self.stream.write_all(&response.into_bytes()).await?;
        self.stream.flush().await
    }
}

fn too_large() -> Response {
    Response::new(StatusCode::PayloadTooLarge).body("Request entity too large")
}
