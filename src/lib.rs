//! Bastion - Embeddable HTTP/1.x Server
//!
//! Core library: incremental HTTP parsing, TLS termination with
//! pre-handshake SNI sniffing, backpressure-aware response streaming and
//! admission-controlled handler dispatch.

pub mod config;
pub mod dispatch;
pub mod http;
pub mod ring;
pub mod server;
pub mod tls;
pub mod vhost;
