use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use bastion::config::Config;
use bastion::http::generator::ResponseWriter;
use bastion::http::request::Request;
use bastion::http::response::{Response, ResponseBuilder, StatusCode};
use bastion::server::Server;
use bastion::vhost::{RequestContext, UploadDecision, UploadPolicy, VirtualHost};

fn test_config() -> Config {
    Config {
        workers: 2,
        queue_depth: 8,
        ..Config::default()
    }
}

async fn start_server(host: Option<VirtualHost>) -> (Server, SocketAddr) {
    let server = Server::new(&test_config());
    if let Some(host) = host {
        server.add_host(host);
    }
    let addr = server.listen("127.0.0.1:0", false).await.unwrap();
    (server, addr)
}

/// Reads one response off the stream: the head up to the blank line, then
/// exactly Content-Length body bytes.
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let content_length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    (head, body)
}

fn echo_host() -> VirtualHost {
    VirtualHost::new(
        "example.com",
        Arc::new(|ctx: &RequestContext, writer: ResponseWriter| {
            let body = format!("{} {}", ctx.request.method.as_str(), ctx.request.uri);
            writer.commit_buffered(Response::ok(body.into_bytes()));
        }),
    )
}

#[tokio::test]
async fn test_keep_alive_serves_second_request_on_same_connection() {
    let (server, addr) = start_server(Some(echo_host())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"GET /first HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Connection: keep-alive"));
    assert_eq!(body, b"GET /first");

    stream
        .write_all(b"GET /second HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"GET /second");

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_close_is_honored() {
    let (server, addr) = start_server(Some(echo_host())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.contains("Connection: close"));

    // Peer closes: further reads hit EOF.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_request_gets_400_and_close() {
    let (server, addr) = start_server(Some(echo_host())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"GET / HTTX/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"));
    assert!(head.contains("Connection: close"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_host_with_no_default_gets_404() {
    let (server, addr) = start_server(None).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: nowhere.invalid\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 404 Not Found"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_head_request_has_headers_but_no_body() {
    let (server, addr) = start_server(Some(echo_host())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"HEAD /x HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8(raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    // Content-Length advertised, body suppressed.
    assert!(text.contains("Content-Length: 7"));
    assert!(text.ends_with("\r\n\r\n"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_streamed_response_arrives_and_closes() {
    let host = VirtualHost::new(
        "example.com",
        Arc::new(|_ctx: &RequestContext, writer: ResponseWriter| {
            let mut response = ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", "text/plain")
                .build();
            response.headers.remove("Content-Length");
            let sink = writer.commit_streamed(response);
            for chunk in ["streamed ", "body ", "bytes"] {
                if sink.write(chunk.as_bytes()).is_err() {
                    return;
                }
            }
            sink.close();
        }),
    );
    let (server, addr) = start_server(Some(host)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"GET /stream HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    // Close-delimited body: read to EOF.
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8(raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("Connection: close"));
    assert!(text.ends_with("streamed body bytes"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_pipelined_requests_are_answered_in_order() {
    let (server, addr) = start_server(Some(echo_host())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(
            b"GET /one HTTP/1.1\r\nHost: example.com\r\n\r\nGET /two HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await
        .unwrap();

    let (_, body) = read_response(&mut stream).await;
    assert_eq!(body, b"GET /one");
    let (_, body) = read_response(&mut stream).await;
    assert_eq!(body, b"GET /two");

    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_that_never_commits_yields_500() {
    let host = VirtualHost::new(
        "example.com",
        Arc::new(|_ctx: &RequestContext, writer: ResponseWriter| {
            drop(writer);
        }),
    );
    let (server, addr) = start_server(Some(host)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 500 Internal Server Error"));
    assert!(head.contains("Connection: close"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_saturated_pool_answers_503_over_the_wire() {
    // 1 worker + 1 queue slot, both occupied by gated handlers; a third
    // request must be shed with a real 503 response.
    let config = Config {
        workers: 1,
        queue_depth: 1,
        ..Config::default()
    };
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let started = Arc::new(AtomicUsize::new(0));

    let handler_gate = Arc::clone(&gate);
    let handler_started = Arc::clone(&started);
    let host = VirtualHost::new(
        "example.com",
        Arc::new(move |_ctx: &RequestContext, writer: ResponseWriter| {
            handler_started.fetch_add(1, Ordering::SeqCst);
            let (lock, cv) = &*handler_gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
            drop(open);
            writer.commit_buffered(Response::ok("released"));
        }),
    );

    let server = Server::new(&config);
    server.add_host(host);
    let addr = server.listen("127.0.0.1:0", false).await.unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

    // First request occupies the only worker.
    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(request).await.unwrap();
    while started.load(Ordering::SeqCst) < 1 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // Second request fills the queue slot.
    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Third request is shed synchronously on the connection task.
    let mut third = TcpStream::connect(addr).await.unwrap();
    third.write_all(request).await.unwrap();
    let (head, _) = read_response(&mut third).await;
    assert!(head.starts_with("HTTP/1.1 503 Service Unavailable"));

    // Release the gate; the accepted requests complete normally.
    let (lock, cv) = &*gate;
    *lock.lock().unwrap() = true;
    cv.notify_all();

    let (head, body) = read_response(&mut first).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"released");
    let (head, _) = read_response(&mut second).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));

    server.shutdown().await;
}

struct RejectAllUploads;

impl UploadPolicy for RejectAllUploads {
    fn review(&self, _head: &Request) -> UploadDecision {
        UploadDecision::Reject(StatusCode::PayloadTooLarge)
    }
}

#[tokio::test]
async fn test_upload_policy_rejection_arrives_before_the_body() {
    let host = echo_host().with_upload_policy(Arc::new(RejectAllUploads));
    let (server, addr) = start_server(Some(host)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Headers only; the declared body is never sent. The rejection must
    // not wait for it.
    stream
        .write_all(b"POST /up HTTP/1.1\r\nHost: example.com\r\nContent-Length: 1000\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 413 Payload Too Large"));
    assert!(head.contains("Connection: close"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.shutdown().await;
}

struct TinyUploadLimit;

impl UploadPolicy for TinyUploadLimit {
    fn review(&self, _head: &Request) -> UploadDecision {
        UploadDecision::Accept { limit: Some(8) }
    }
}

#[tokio::test]
async fn test_declared_length_over_upload_limit_gets_413() {
    let host = echo_host().with_upload_policy(Arc::new(TinyUploadLimit));
    let (server, addr) = start_server(Some(host)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"POST /up HTTP/1.1\r\nHost: example.com\r\nContent-Length: 100\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 413 Payload Too Large"));
    assert!(head.contains("Connection: close"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_reads_compression_verdict_from_context() {
    let host = VirtualHost::new(
        "example.com",
        Arc::new(|ctx: &RequestContext, writer: ResponseWriter| {
            let compressible = ctx.response_policy.compress("application/json");
            let response = ResponseBuilder::new(StatusCode::Ok)
                .header("X-Compressible", if compressible { "1" } else { "0" })
                .build();
            writer.commit_buffered(response);
        }),
    );
    let (server, addr) = start_server(Some(host)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.contains("X-Compressible: 1"));

    server.shutdown().await;
}
