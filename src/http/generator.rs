//! Response generation: buffered (serialized up front, drained by a
//! cursor) and streamed (a handler thread feeds a bounded ring buffer that
//! the connection task drains). A full ring blocks the producer; the
//! consumer never blocks, it observes [`Generate::Pause`] and awaits the
//! readiness notification.

use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Notify, oneshot};

use crate::http::response::Response;
use crate::ring::RingBuffer;

/// Outcome of a `generate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generate {
    // More bytes may be available right now; call again.
    Continue,
    // Stream still open but nothing buffered; wait for the readiness
    // notification instead of spinning.
    Pause,
    Stop,
}

fn status_line(response: &Response) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {} {}\r\n",
        response.status.as_u16(),
        response.status.reason_phrase()
    ))
}

// Header block including the terminating blank line.
fn header_block(response: &Response) -> Bytes {
    let mut buf = Vec::new();
    for (name, value) in &response.headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    Bytes::from(buf)
}

// Sets the `Connection` response header when the handler did not decide
// itself. `keep_alive` is the request/policy verdict.
fn frame_connection(response: Response, keep_alive: bool) -> Response {
    if response.header("connection").is_some() {
        return response;
    }
    response.with_header("Connection", if keep_alive { "keep-alive" } else { "close" })
}

/// Precomputed response: an immutable block list plus a (block, offset)
/// cursor.
pub struct BufferedGenerator {
    blocks: Vec<Bytes>,
    block: usize,
    offset: usize,
    keep_alive: bool,
}

impl BufferedGenerator {
    /// The body block is suppressed for HEAD requests and for bodyless
    /// statuses (1xx/204/304).
    pub fn new(response: &Response, head_only: bool) -> Self {
        let mut blocks = vec![status_line(response), header_block(response)];
        if !head_only && !response.status.bodyless() && !response.body.is_empty() {
            blocks.push(Bytes::from(response.body.clone()));
        }
        Self {
            blocks,
            block: 0,
            offset: 0,
            keep_alive: response.keep_alive(),
        }
    }

    pub fn generate(&mut self, out: &mut [u8]) -> (usize, Generate) {
        let mut written = 0;
        while written < out.len() && self.block < self.blocks.len() {
            let block = &self.blocks[self.block];
            let pending = &block[self.offset..];
            let n = pending.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&pending[..n]);
            written += n;
            self.offset += n;
            if self.offset == block.len() {
                self.block += 1;
                self.offset = 0;
            }
        }
        if self.block == self.blocks.len() {
            (written, Generate::Stop)
        } else {
            (written, Generate::Continue)
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// Error surfaced to a streaming handler.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The connection was torn down while the handler was still producing
    /// bytes; the producer is woken rather than left blocked forever.
    #[error("response sink closed: connection is gone")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Uncommitted,
    Stream,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    ReadResponse,
    ReadBody,
    Closed,
}

struct StreamedInner {
    ring: RingBuffer,
    // Pending response; headers stay mutable until the first commit.
    response: Option<Response>,
    // Frozen head blocks, set exactly once at commit.
    head: Option<[Bytes; 2]>,
    write: WriteState,
    keep_alive: bool,
    // Request/policy keep-alive verdict, applied at commit framing.
    keep_alive_hint: bool,
    consumer_gone: bool,
    // Single-shot: the consumer arms this when it pauses, the producer
    // clears it when it notifies.
    require_callback: bool,
}

struct StreamedShared {
    inner: Mutex<StreamedInner>,
    // Producer waits here for ring space.
    space: Condvar,
    // Wakes the connection task when bytes, the commit or close arrive.
    readable: Notify,
}

impl StreamedShared {
    // Freezes status + headers at the first write, flush or close.
    fn commit(&self, inner: &mut StreamedInner) {
        if inner.write != WriteState::Uncommitted {
            return;
        }
        let mut response = match inner.response.take() {
            Some(r) => r,
            None => return,
        };
        // Without a known Content-Length the body is close-delimited; no
        // chunked encoding is emitted.
        if response.header("content-length").is_none() {
            response = response.with_header("Connection", "close");
        } else {
            response = frame_connection(response, inner.keep_alive_hint);
        }
        inner.keep_alive = response.keep_alive();
        inner.head = Some([status_line(&response), header_block(&response)]);
        inner.write = WriteState::Stream;
    }

    fn notify_readable(&self, inner: &mut StreamedInner) {
        if inner.require_callback {
            inner.require_callback = false;
            self.readable.notify_one();
        }
    }
}

/// Producer half of a streamed response, handed to the handler thread.
pub struct BodySink {
    shared: Arc<StreamedShared>,
}

impl BodySink {
    /// Adds or replaces a header; refused once the first write has
    /// committed the response.
    pub fn set_header(&self, name: &str, value: impl Into<String>) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.response.take() {
            Some(r) => {
                inner.response = Some(r.with_header(name, value));
                true
            }
            None => false,
        }
    }

    /// Pushes body bytes, committing the response on the first call.
    /// Blocks while the ring is full; fails with [`SinkError::Closed`] if
    /// the connection is torn down, including while blocked.
    pub fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.write == WriteState::Closed || inner.consumer_gone {
            return Err(SinkError::Closed);
        }
        self.shared.commit(&mut inner);
        self.shared.notify_readable(&mut inner);

        let mut remaining = data;
        while !remaining.is_empty() {
            if inner.consumer_gone {
                return Err(SinkError::Closed);
            }
            let n = inner.ring.write(remaining);
            if n > 0 {
                remaining = &remaining[n..];
                self.shared.notify_readable(&mut inner);
            } else {
                inner = self.shared.space.wait(inner).unwrap();
            }
        }
        Ok(())
    }

    /// Commits the response without writing body bytes.
    pub fn flush(&self) -> Result<(), SinkError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.consumer_gone {
            return Err(SinkError::Closed);
        }
        self.shared.commit(&mut inner);
        self.shared.notify_readable(&mut inner);
        Ok(())
    }

    /// Ends the body stream. Also performed on drop.
    pub fn close(self) {}
}

impl Drop for BodySink {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().unwrap();
        self.shared.commit(&mut inner);
        inner.write = WriteState::Closed;
        self.shared.notify_readable(&mut inner);
    }
}

/// Consumer half of a streamed response, owned by the connection task.
pub struct StreamedGenerator {
    shared: Arc<StreamedShared>,
    state: ReadState,
    head: Option<[Bytes; 2]>,
    head_block: usize,
    head_offset: usize,
    // HEAD request: body bytes are drained and discarded so the producer
    // still unblocks, but nothing is emitted.
    discard_body: bool,
}

impl StreamedGenerator {
    /// Returns [`Generate::Pause`] (never a busy `Continue`) when no bytes
    /// are buffered but the write side is still open.
    pub fn generate(&mut self, out: &mut [u8]) -> (usize, Generate) {
        let mut inner = self.shared.inner.lock().unwrap();

        if self.state == ReadState::Closed {
            return (0, Generate::Stop);
        }
        if inner.write == WriteState::Uncommitted {
            inner.require_callback = true;
            return (0, Generate::Pause);
        }

        let mut written = 0;

        if self.state == ReadState::ReadResponse {
            if self.head.is_none() {
                self.head = inner.head.take();
            }
            if let Some(head) = &self.head {
                while self.head_block < head.len() && written < out.len() {
                    let block = &head[self.head_block];
                    let pending = &block[self.head_offset..];
                    let n = pending.len().min(out.len() - written);
                    out[written..written + n].copy_from_slice(&pending[..n]);
                    written += n;
                    self.head_offset += n;
                    if self.head_offset == block.len() {
                        self.head_block += 1;
                        self.head_offset = 0;
                    }
                }
                if self.head_block == head.len() {
                    self.head = None;
                    self.state = ReadState::ReadBody;
                } else {
                    return (written, Generate::Continue);
                }
            }
        }

        let mut drained = false;
        if self.discard_body {
            let mut scratch = [0u8; 512];
            while inner.ring.read(&mut scratch) > 0 {
                drained = true;
            }
        } else {
            loop {
                let n = inner.ring.read(&mut out[written..]);
                if n == 0 {
                    break;
                }
                drained = true;
                written += n;
            }
        }
        if drained {
            // Unblock a producer waiting for space.
            self.shared.space.notify_all();
        }

        if inner.ring.is_empty() && inner.write == WriteState::Closed {
            self.state = ReadState::Closed;
            return (written, Generate::Stop);
        }
        if written == 0 {
            inner.require_callback = true;
            return (0, Generate::Pause);
        }
        (written, Generate::Continue)
    }

    pub fn keep_alive(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.keep_alive
    }

    /// Resolves when the producer signals new data, the commit or close.
    pub async fn ready(&self) {
        self.shared.readable.notified().await;
    }
}

impl Drop for StreamedGenerator {
    fn drop(&mut self) {
        // Connection torn down: wake any blocked producer so its next write
        // fails with SinkError::Closed instead of blocking forever.
        let mut inner = self.shared.inner.lock().unwrap();
        inner.consumer_gone = true;
        drop(inner);
        self.shared.space.notify_all();
    }
}

/// Creates the two halves of a streamed response.
pub fn streamed(
    response: Response,
    keep_alive_hint: bool,
    head_only: bool,
    ring_capacity: usize,
) -> (StreamedGenerator, BodySink) {
    let shared = Arc::new(StreamedShared {
        inner: Mutex::new(StreamedInner {
            ring: RingBuffer::with_capacity(ring_capacity),
            response: Some(response),
            head: None,
            write: WriteState::Uncommitted,
            keep_alive: false,
            keep_alive_hint,
            consumer_gone: false,
            require_callback: false,
        }),
        space: Condvar::new(),
        readable: Notify::new(),
    });
    let generator = StreamedGenerator {
        shared: Arc::clone(&shared),
        state: ReadState::ReadResponse,
        head: None,
        head_block: 0,
        head_offset: 0,
        discard_body: head_only,
    };
    (generator, BodySink { shared })
}

/// A committed response on its way back to the connection task.
pub enum Commit {
    Buffered(BufferedGenerator),
    Streamed(StreamedGenerator),
}

/// One-shot capability to answer a single request. The commit methods
/// consume the writer, so a second commit is a compile error; dropping the
/// writer without committing is answered with a 500.
pub struct ResponseWriter {
    tx: oneshot::Sender<Commit>,
    head_only: bool,
    keep_alive: bool,
    ring_capacity: usize,
}

impl ResponseWriter {
    pub(crate) fn new(
        tx: oneshot::Sender<Commit>,
        head_only: bool,
        keep_alive: bool,
        ring_capacity: usize,
    ) -> Self {
        Self {
            tx,
            head_only,
            keep_alive,
            ring_capacity,
        }
    }

    pub fn commit_buffered(self, response: Response) {
        let response = frame_connection(response, self.keep_alive);
        let generator = BufferedGenerator::new(&response, self.head_only);
        // The connection may already be gone; nothing to do then.
        let _ = self.tx.send(Commit::Buffered(generator));
    }

    /// Returns the sink the handler feeds body bytes into.
    pub fn commit_streamed(self, response: Response) -> BodySink {
        let (generator, sink) = streamed(response, self.keep_alive, self.head_only, self.ring_capacity);
        let _ = self.tx.send(Commit::Streamed(generator));
        sink
    }
}
