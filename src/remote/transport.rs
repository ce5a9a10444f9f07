//! Message Transports
//!
//! A [`MessageConnection`] carries one request frame and returns one response
//! frame. Two implementations:
//!
//! - [`DirectConnection`]: in-process, hands frames straight to a
//!   [`FrameHandler`]
//! - [`TcpConnection`]: length-delimited frames over TCP, many requests in
//!   flight at once
//!
//! # TCP framing
//!
//! ```text
//! ┌───────────────┬─────────────────┬────────────────────────┐
//! │ length (u32)  │ request id (u64)│ payload                │
//! └───────────────┴─────────────────┴────────────────────────┘
//! ```
//!
//! The server echoes the request id, and a reader task on the client side
//! routes each response to the caller waiting on that id.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics::CONNECTIONS;

/// Default bound on a single request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest accepted frame
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const REQUEST_ID_LEN: usize = 8;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

fn with_request_id(request_id: u64, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(REQUEST_ID_LEN + payload.len());
    frame.put_u64(request_id);
    frame.put_slice(payload);
    frame.freeze()
}

fn split_request_id(mut frame: BytesMut) -> Option<(u64, Bytes)> {
    if frame.len() < REQUEST_ID_LEN {
        return None;
    }
    let request_id = frame.get_u64();
    Some((request_id, frame.freeze()))
}

// =============================================================================
// Connection Traits
// =============================================================================

/// Client end of a request/response connection
#[async_trait]
pub trait MessageConnection: Send + Sync {
    /// Send one request frame and wait for its response frame.
    async fn call(&self, request: Bytes) -> Result<Bytes>;
}

/// Server side: turns one request frame into one response frame
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, request: Bytes) -> Bytes;
}

// =============================================================================
// Direct Connection
// =============================================================================

/// In-process connection to a frame handler
pub struct DirectConnection {
    handler: Arc<dyn FrameHandler>,
    timeout: Duration,
}

impl DirectConnection {
    pub fn new(handler: Arc<dyn FrameHandler>) -> Self {
        Self::with_timeout(handler, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(handler: Arc<dyn FrameHandler>, timeout: Duration) -> Self {
        Self { handler, timeout }
    }
}

#[async_trait]
impl MessageConnection for DirectConnection {
    async fn call(&self, request: Bytes) -> Result<Bytes> {
        tokio::time::timeout(self.timeout, self.handler.handle_frame(request))
            .await
            .map_err(|_| Error::Timeout {
                after: self.timeout,
            })
    }
}

// =============================================================================
// TCP Connection
// =============================================================================

type Waiters = DashMap<u64, oneshot::Sender<Bytes>>;

/// Multiplexed TCP connection to a cache server
pub struct TcpConnection {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    waiters: Arc<Waiters>,
    closed: Arc<AtomicBool>,
    next_request: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl TcpConnection {
    /// Connect to a server.
    pub async fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout { after: timeout })??;
        Self::from_stream(stream, timeout)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let waiters: Arc<Waiters> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(Self::read_responses(
            FramedRead::new(read_half, codec()),
            waiters.clone(),
            closed.clone(),
            peer,
        ));

        debug!(%peer, "connected to cache server");
        Ok(Self {
            writer: Mutex::new(FramedWrite::new(write_half, codec())),
            waiters,
            closed,
            next_request: AtomicU64::new(1),
            timeout,
            reader,
        })
    }

    /// Whether the server side has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn read_responses(
        mut frames: FramedRead<tokio::net::tcp::OwnedReadHalf, LengthDelimitedCodec>,
        waiters: Arc<Waiters>,
        closed: Arc<AtomicBool>,
        peer: SocketAddr,
    ) {
        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(%peer, error = %e, "cache connection read failed");
                    break;
                }
            };
            match split_request_id(frame) {
                Some((request_id, payload)) => {
                    if let Some((_, waiter)) = waiters.remove(&request_id) {
                        let _ = waiter.send(payload);
                    }
                }
                None => warn!(%peer, "dropping short response frame"),
            }
        }
        closed.store(true, Ordering::Release);
        // Dropping the senders fails every outstanding call
        waiters.clear();
        debug!(%peer, "cache connection closed");
    }
}

#[async_trait]
impl MessageConnection for TcpConnection {
    /// Waiting for the writer, writing the frame and waiting for the response
    /// all count against one deadline.
    async fn call(&self, request: Bytes) -> Result<Bytes> {
        let deadline = Instant::now() + self.timeout;
        let timed_out = Error::Timeout {
            after: self.timeout,
        };
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id, tx);
        if self.is_closed() {
            self.waiters.remove(&request_id);
            return Err(Error::ConnectionClosed);
        }

        let Ok(mut writer) = tokio::time::timeout_at(deadline, self.writer.lock()).await else {
            self.waiters.remove(&request_id);
            return Err(timed_out);
        };
        if self.is_closed() {
            self.waiters.remove(&request_id);
            return Err(Error::ConnectionClosed);
        }
        let frame = with_request_id(request_id, &request);
        match tokio::time::timeout_at(deadline, writer.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.waiters.remove(&request_id);
                debug!(error = %e, "cache request write failed");
                return Err(Error::ConnectionClosed);
            }
            Err(_) => {
                // A partly written frame leaves the stream unusable
                self.closed.store(true, Ordering::Release);
                self.waiters.remove(&request_id);
                warn!(after = ?self.timeout, "cache request write timed out, closing connection");
                return Err(timed_out);
            }
        }
        drop(writer);

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.waiters.remove(&request_id);
                Err(timed_out)
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// =============================================================================
// Server Side
// =============================================================================

/// Serve one accepted TCP connection until the client disconnects.
///
/// Each request runs in its own task; responses are written back in
/// completion order.
pub async fn serve_connection(handler: Arc<dyn FrameHandler>, stream: TcpStream) -> Result<()> {
    let connection_id = Uuid::new_v4();
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let span = tracing::info_span!("connection", id = %connection_id, %peer);

    async move {
        CONNECTIONS.inc();
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, codec());
        let mut sink = FramedWrite::new(write_half, codec());
        let (tx, mut rx) = mpsc::channel::<Bytes>(256);

        let writer = tokio::spawn(
            async move {
                while let Some(frame) = rx.recv().await {
                    if let Err(e) = sink.send(frame).await {
                        warn!(error = %e, "cache response write failed");
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        let mut result = Ok(());
        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    result = Err(Error::Io(e));
                    break;
                }
            };
            let Some((request_id, payload)) = split_request_id(frame) else {
                warn!("dropping short request frame");
                continue;
            };
            let handler = handler.clone();
            let tx = tx.clone();
            tokio::spawn(
                async move {
                    let response = handler.handle_frame(payload).await;
                    let _ = tx.send(with_request_id(request_id, &response)).await;
                }
                .in_current_span(),
            );
        }

        drop(tx);
        let _ = writer.await;
        CONNECTIONS.dec();
        debug!("client disconnected");
        result
    }
    .instrument(span)
    .await
}

// =============================================================================
// Tests
// =============================================================================
