//! The response sink collaborator and the client channel registry.
//!
//! The engine never writes to a socket directly; every response and every
//! stream chunk goes through a [`ResponseSink`]. The default sink speaks
//! HTTP/1.1 over the registered client channels. Tests substitute a
//! recording sink to observe the wire without a socket.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use marlin_types::{BodyBuffer, HttpResponse, RequestId};
use parking_lot::Mutex;

use crate::error::TransportError;

/// How the response side of a channel is being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    /// One complete response with a Content-Length.
    Full,
    /// Chunked transfer encoding.
    Chunked,
    /// A long-lived raw stream (server push events); no framing.
    Stream,
}

/// One live client connection the sink can write to.
pub struct ClientChannel {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
    mode: Mutex<ChannelMode>,
}

impl ClientChannel {
    fn new(stream: TcpStream) -> Self {
        ClientChannel {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
            mode: Mutex::new(ChannelMode::Full),
        }
    }

    /// Whether the channel has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionLost);
        }
        let mut stream = self.stream.lock();
        stream.write_all(bytes).map_err(|error| {
            self.open.store(false, Ordering::SeqCst);
            TransportError::WriteFailed(error)
        })?;
        stream.flush().map_err(TransportError::WriteFailed)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let stream = self.stream.lock();
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Registry of live channels keyed by opaque request id.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<u64, Arc<ClientChannel>>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ChannelRegistry {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection and hands out the request id for it.
    pub fn register(&self, stream: TcpStream) -> RequestId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.channels
            .lock()
            .insert(id, Arc::new(ClientChannel::new(stream)));
        RequestId::new(id)
    }

    /// The channel for a request id, if it is still registered.
    pub fn get(&self, id: RequestId) -> Option<Arc<ClientChannel>> {
        self.channels.lock().get(&id.into_inner()).cloned()
    }

    /// Closes and forgets the channel for `id`.
    pub fn close(&self, id: RequestId) {
        if let Some(channel) = self.channels.lock().remove(&id.into_inner()) {
            channel.close();
        }
    }

    /// Forgets the channel without closing the socket.
    ///
    /// Used when the connection loop keeps ownership across keep-alive
    /// requests under a fresh id.
    pub fn forget(&self, id: RequestId) {
        self.channels.lock().remove(&id.into_inner());
    }

    /// Closes every channel; used during shutdown.
    pub fn close_all(&self) {
        let channels: Vec<Arc<ClientChannel>> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close();
        }
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }
}

/// Writes responses back to client channels.
///
/// Exactly one successful [`ResponseSink::send_response`] extinguishes a
/// response; the pipeline's answered latch enforces the "exactly one"
/// part, the sink enforces the writing.
pub trait ResponseSink: Send + Sync {
    /// Writes one complete response.
    fn send_response(&self, response: &HttpResponse) -> Result<(), TransportError>;

    /// Writes the head of a long-lived stream response and leaves the
    /// channel open for chunks.
    fn open_stream(&self, response: &HttpResponse) -> Result<(), TransportError>;

    /// Writes one raw chunk to a stream opened with `open_stream`.
    fn send_stream_chunk(&self, id: RequestId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Writes the head of a chunked transfer-encoding response.
    fn open_chunked(&self, response: &HttpResponse) -> Result<(), TransportError>;

    /// Writes one framed chunk; `last` adds the terminating chunk.
    fn send_chunk(&self, id: RequestId, bytes: &[u8], last: bool) -> Result<(), TransportError>;

    /// Tears the stream down, closing the client channel.
    fn cancel_stream(&self, id: RequestId);
}

/// The default HTTP/1.1 sink over TCP client channels.
pub struct TcpResponseSink {
    channels: Arc<ChannelRegistry>,
}

impl TcpResponseSink {
    /// A sink writing through the given channel registry.
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        TcpResponseSink { channels }
    }

    fn channel(&self, id: RequestId) -> Result<Arc<ClientChannel>, TransportError> {
        if !id.is_live() {
            // A cleared id means the response channel was deliberately
            // detached (async sites); sends become no-ops upstream.
            return Err(TransportError::NoChannel(0));
        }
        self.channels
            .get(id)
            .ok_or(TransportError::NoChannel(id.into_inner()))
    }
}

/// Renders status line, headers and cookies of `response`.
fn render_head(response: &HttpResponse, extra: &[(&str, String)]) -> String {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        response.reason_text()
    );
    for (name, value) in response.headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    for cookie in &response.cookies {
        head.push_str("Set-Cookie: ");
        head.push_str(&cookie.to_set_cookie_value());
        head.push_str("\r\n");
    }
    for (name, value) in extra {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

fn body_bytes(response: &HttpResponse) -> Result<Vec<u8>, TransportError> {
    let mut bytes = match &response.body {
        BodyBuffer::Empty => Vec::new(),
        BodyBuffer::Bytes(bytes) => bytes.clone(),
        BodyBuffer::File(path) => std::fs::read(path).map_err(TransportError::WriteFailed)?,
    };
    if response.send_bom {
        let mut with_bom = vec![0xEF, 0xBB, 0xBF];
        with_bom.append(&mut bytes);
        bytes = with_bom;
    }
    Ok(bytes)
}

impl ResponseSink for TcpResponseSink {
    fn send_response(&self, response: &HttpResponse) -> Result<(), TransportError> {
        let channel = self.channel(response.request_id)?;
        let body = body_bytes(response)?;
        let mut extra: Vec<(&str, String)> = Vec::new();
        if !response.headers.contains("Content-Length") {
            extra.push(("Content-Length", body.len().to_string()));
        }
        let mut wire = render_head(response, &extra).into_bytes();
        wire.extend_from_slice(&body);
        channel.write_all(&wire)?;
        *channel.mode.lock() = ChannelMode::Full;
        Ok(())
    }

    fn open_stream(&self, response: &HttpResponse) -> Result<(), TransportError> {
        let channel = self.channel(response.request_id)?;
        let mut wire = render_head(response, &[]).into_bytes();
        if response.send_bom {
            wire.extend_from_slice(&[0xEF, 0xBB, 0xBF]);
        }
        channel.write_all(&wire)?;
        *channel.mode.lock() = ChannelMode::Stream;
        Ok(())
    }

    fn send_stream_chunk(&self, id: RequestId, bytes: &[u8]) -> Result<(), TransportError> {
        let channel = self.channel(id)?;
        channel.write_all(bytes)
    }

    fn open_chunked(&self, response: &HttpResponse) -> Result<(), TransportError> {
        let channel = self.channel(response.request_id)?;
        let extra = [("Transfer-Encoding", "chunked".to_owned())];
        channel.write_all(render_head(response, &extra).as_bytes())?;
        *channel.mode.lock() = ChannelMode::Chunked;
        Ok(())
    }

    fn send_chunk(&self, id: RequestId, bytes: &[u8], last: bool) -> Result<(), TransportError> {
        let channel = self.channel(id)?;
        let mut wire = Vec::with_capacity(bytes.len() + 32);
        if !bytes.is_empty() {
            wire.extend_from_slice(format!("{:x}\r\n", bytes.len()).as_bytes());
            wire.extend_from_slice(bytes);
            wire.extend_from_slice(b"\r\n");
        }
        if last {
            wire.extend_from_slice(b"0\r\n\r\n");
        }
        channel.write_all(&wire)
    }

    fn cancel_stream(&self, id: RequestId) {
        self.channels.close(id);
    }
}
