use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::dispatch::{Dispatcher, Overloaded};
use crate::http::generator::{BufferedGenerator, Commit, Generate, ResponseWriter, StreamedGenerator};
use crate::http::parser::{ParseError, ParseStatus, RequestParser};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::vhost::{ConnectionInfo, RequestContext, UploadDecision, VirtualHosts};

const READ_CHUNK: usize = 4096;
const WRITE_CHUNK: usize = 8192;

enum ReadOutcome {
    // A complete request; pipelined bytes stay buffered.
    Request(Request),
    // The parser gave up; answer with the error's status and close.
    Bad(ParseError),
    // The upload policy refused the body before it was read.
    PolicyReject(StatusCode),
    Eof,
}

/// Drives one accepted connection: reads bytes into the parser, dispatches
/// completed requests to the worker pool, and streams the committed
/// response back. All mutable state lives inside the connection's own
/// spawned task; cross-thread traffic is limited to the commit channel and
/// the streamed-response ring buffer.
pub struct Connection<S> {
    info: ConnectionInfo,
    stream: S,
    buffer: BytesMut,
    parser: RequestParser,
    hosts: Arc<VirtualHosts>,
    dispatcher: Arc<Dispatcher>,
    ring_capacity: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(
        stream: S,
        info: ConnectionInfo,
        hosts: Arc<VirtualHosts>,
        dispatcher: Arc<Dispatcher>,
        ring_capacity: usize,
    ) -> Self {
        Self {
            info,
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            parser: RequestParser::new(),
            hosts,
            dispatcher,
            ring_capacity,
        }
    }

    /// Request/response loop until close. Request N+1 is not dispatched
    /// before request N's response has fully drained.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match self.read_request().await? {
                ReadOutcome::Eof => break,
                ReadOutcome::Bad(err) => {
                    tracing::warn!(connection = %self.info.id, error = %err, "malformed request");
                    // Never keep-alive after a parse error.
                    let response =
                        Response::error(err.status()).with_header("Connection", "close");
                    self.write_response(response).await?;
                    break;
                }
                ReadOutcome::PolicyReject(status) => {
                    tracing::debug!(connection = %self.info.id, status = status.as_u16(), "upload rejected by policy");
                    // The body was never read, so the stream cannot be
                    // resynchronized; close after the error response.
                    let response = Response::error(status).with_header("Connection", "close");
                    self.write_response(response).await?;
                    break;
                }
                ReadOutcome::Request(request) => {
                    let keep_alive = self.dispatch(request).await?;
                    if keep_alive {
                        self.parser.reset();
                    } else {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // Feeds buffered bytes to the parser, reading more as needed, until a
    // full request or a terminal condition is available.
    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        loop {
            match self.parser.parse(&self.buffer) {
                Ok((status, consumed)) => {
                    self.buffer.advance(consumed);
                    match status {
                        ParseStatus::Complete => {
                            let request = self
                                .parser
                                .take_request()
                                .ok_or_else(|| anyhow::anyhow!("parser lost completed request"))?;
                            return Ok(ReadOutcome::Request(request));
                        }
                        ParseStatus::HeadersComplete => {
                            if let Some(outcome) = self.review_upload() {
                                return Ok(outcome);
                            }
                            // Body bytes may already be buffered.
                            continue;
                        }
                        ParseStatus::Incomplete => {}
                    }
                }
                Err(err) => return Ok(ReadOutcome::Bad(err)),
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Ok(ReadOutcome::Eof);
            }
        }
    }

    // Upload-policy check at the headers/body boundary.
    fn review_upload(&mut self) -> Option<ReadOutcome> {
        let head = self.parser.head()?;
        let decision = match self.hosts.resolve(head.host().as_deref()) {
            Some(host) => host.upload_policy().review(head),
            None => UploadDecision::Accept { limit: None },
        };
        match decision {
            UploadDecision::Reject(status) => Some(ReadOutcome::PolicyReject(status)),
            UploadDecision::Accept { limit } => match self.parser.set_body_limit(limit) {
                Ok(()) => None,
                Err(err) => Some(ReadOutcome::Bad(err)),
            },
        }
    }

    // Hands the request to the worker pool and drains the committed
    // response. Returns whether the connection stays open.
    async fn dispatch(&mut self, request: Request) -> anyhow::Result<bool> {
        let host = match self.hosts.resolve(request.host().as_deref()) {
            Some(host) => host,
            None => {
                // Recoverable at the HTTP level, unlike the TLS-time miss.
                let keep_alive = request.keep_alive();
                let response = Response::not_found()
                    .with_header("Connection", if keep_alive { "keep-alive" } else { "close" });
                self.write_response(response).await?;
                return Ok(keep_alive);
            }
        };

        let response_policy = host.response_policy();
        let keep_alive_hint = response_policy.keep_alive(&request);
        let head_only = request.method == Method::HEAD;

        let (tx, rx) = oneshot::channel();
        let writer = ResponseWriter::new(tx, head_only, keep_alive_hint, self.ring_capacity);
        let handler = host.handler();
        let ctx = RequestContext {
            connection: self.info.clone(),
            request,
            response_policy,
        };

        if let Err(Overloaded) = self.dispatcher.submit(move || handler.handle(&ctx, writer)) {
            // Tail drop: shed synchronously on the connection task, the
            // pool never sees the job.
            tracing::warn!(connection = %self.info.id, "dispatcher saturated, shedding request");
            let response = Response::service_unavailable()
                .with_header("Connection", if keep_alive_hint { "keep-alive" } else { "close" });
            self.write_response(response).await?;
            return Ok(keep_alive_hint);
        }

        match rx.await {
            Ok(Commit::Buffered(mut generator)) => {
                self.drive_buffered(&mut generator).await?;
                Ok(generator.keep_alive())
            }
            Ok(Commit::Streamed(mut generator)) => {
                self.drive_streamed(&mut generator).await?;
                Ok(generator.keep_alive())
            }
            Err(_) => {
                // Handler dropped the writer without committing (panic or
                // programming error). The worker survived; this request
                // gets a 500 and the connection closes.
                tracing::error!(connection = %self.info.id, "handler finished without committing a response");
                let response =
                    Response::internal_error().with_header("Connection", "close");
                self.write_response(response).await?;
                Ok(false)
            }
        }
    }

    // Connection-level responses: errors, shedding.
    async fn write_response(&mut self, response: Response) -> anyhow::Result<()> {
        let mut generator = BufferedGenerator::new(&response, false);
        self.drive_buffered(&mut generator).await
    }

    async fn drive_buffered(&mut self, generator: &mut BufferedGenerator) -> anyhow::Result<()> {
        let mut out = [0u8; WRITE_CHUNK];
        loop {
            let (n, outcome) = generator.generate(&mut out);
            if n > 0 {
                self.stream.write_all(&out[..n]).await?;
            }
            match outcome {
                Generate::Stop => {
                    self.stream.flush().await?;
                    return Ok(());
                }
                Generate::Continue | Generate::Pause => {}
            }
        }
    }

    async fn drive_streamed(&mut self, generator: &mut StreamedGenerator) -> anyhow::Result<()> {
        let mut out = [0u8; WRITE_CHUNK];
        loop {
            let (n, outcome) = generator.generate(&mut out);
            if n > 0 {
                self.stream.write_all(&out[..n]).await?;
            }
            match outcome {
                Generate::Stop => {
                    self.stream.flush().await?;
                    return Ok(());
                }
                Generate::Continue => {}
                Generate::Pause => {
                    // Push what we have to the client, then sleep until the
                    // producer signals more data (or the close).
                    self.stream.flush().await?;
                    generator.ready().await;
                }
            }
        }
    }
}
