//! Message transports.
//!
//! [`LineTransport`] carries one JSON message per line over any async byte
//! stream; [`StdioTransport`] is the stdin/stdout instance used by the server.
//! Reading happens on a background task so `recv` is cancellation safe and can
//! sit in a `select!` next to running tool calls.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

pub type Incoming = Result<JsonRpcRequest, TransportError>;

#[async_trait]
pub trait Transport: Send {
    /// Next incoming message. `None` once the peer has gone away.
    ///
    /// Must be cancellation safe.
    async fn recv(&mut self) -> Option<Incoming>;

    async fn send(&mut self, response: JsonRpcResponse) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// Decode one line into a request.
pub fn decode_line(line: &str) -> Incoming {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

const INBOX_CAPACITY: usize = 64;

pub struct LineTransport<W> {
    inbox: mpsc::Receiver<Incoming>,
    reader: JoinHandle<()>,
    writer: W,
    closed: bool,
}

pub type StdioTransport = LineTransport<Stdout>;

impl LineTransport<Stdout> {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<W> LineTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Must be called from within a tokio runtime.
    pub fn new<R>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let reader = tokio::spawn(read_lines(reader, tx));
        Self {
            inbox,
            reader,
            writer,
            closed: false,
        }
    }
}

async fn read_lines<R>(reader: R, tx: mpsc::Sender<Incoming>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if tx.send(decode_line(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Input stream reached EOF");
                break;
            }
            Err(e) => {
                warn!("Failed to read input stream: {}", e);
                let _ = tx.send(Err(TransportError::Io(e))).await;
                break;
            }
        }
    }
}

#[async_trait]
impl<W> Transport for LineTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Option<Incoming> {
        if self.closed {
            return None;
        }
        self.inbox.recv().await
    }

    async fn send(&mut self, response: JsonRpcResponse) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.reader.abort();
            self.inbox.close();
            self.writer.flush().await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<W> Drop for LineTransport<W> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// In-memory transport for tests and embedding.
///
/// Queued messages are delivered in order; once the queue is drained `recv`
/// reports end of input.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    incoming: VecDeque<Incoming>,
    sent: Vec<JsonRpcResponse>,
    closed: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_request(&self, request: JsonRpcRequest) {
        self.state.lock().incoming.push_back(Ok(request));
    }

    /// Queue a raw line as if it had been read from the wire.
    pub fn push_line(&self, line: &str) {
        self.state.lock().incoming.push_back(decode_line(line));
    }

    pub fn responses(&self) -> Vec<JsonRpcResponse> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn recv(&mut self) -> Option<Incoming> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.incoming.pop_front()
    }

    async fn send(&mut self, response: JsonRpcResponse) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.sent.push(response);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
