//! HTTP protocol implementation.
//!
//! This module implements an HTTP/1.0 and HTTP/1.1 server core with
//! keep-alive, pipelining-safe incremental parsing and two response
//! strategies.
//!
//! # Architecture
//!
//! - **`connection`**: the per-connection driver implementing the
//!   request-response state machine
//! - **`parser`**: resumable byte-stream request parser
//! - **`request`**: HTTP request value type and builder
//! - **`response`**: HTTP response value type with builder pattern
//! - **`generator`**: buffered and streamed response generation with
//!   ring-buffer backpressure
//!
//! # Connection state machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Feed incoming bytes to the parser
//!        └──────┬──────┘
//!               │ Request complete
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatching    │ ← Handler runs on a worker thread
//!        └──────┬───────────┘
//!               │ Response committed
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Drain the response generator
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod connection;
pub mod generator;
pub mod parser;
pub mod request;
pub mod response;
