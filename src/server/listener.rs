use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::http::connection::Connection;
use crate::tls;
use crate::vhost::{ConnectionId, ConnectionInfo, VirtualHosts};

/// Accept loop for one listening socket. Runs until the shutdown signal
/// flips; each accepted connection gets its own task.
pub async fn run(
    listener: TcpListener,
    tls: bool,
    hosts: Arc<VirtualHosts>,
    dispatcher: Arc<Dispatcher>,
    ring_capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => {
                info!("Listener shutting down");
                return;
            }
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                // Transient accept failures must not kill the loop.
                tracing::warn!("Accept error: {}", e);
                continue;
            }
        };

        let info = ConnectionInfo {
            id: ConnectionId::new(),
            secure: tls,
            created: Instant::now(),
            local_addr: socket.local_addr().unwrap_or(peer),
            peer_addr: peer,
        };
        debug!(connection = %info.id, peer = %peer, secure = tls, "Accepted connection");

        let hosts = Arc::clone(&hosts);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if tls {
                // SNI sniff + context selection + handshake. Failures are
                // fatal for the connection and produce no response: the
                // peer never sent anything interpretable as HTTP.
                match tls::accept(socket, &hosts).await {
                    Ok((stream, sni)) => {
                        debug!(connection = %info.id, sni = ?sni, "TLS established");
                        let mut conn =
                            Connection::new(stream, info.clone(), hosts, dispatcher, ring_capacity);
                        if let Err(e) = conn.run().await {
                            tracing::error!(connection = %info.id, peer = %peer, "Connection error: {}", e);
                        }
                    }
                    Err(e) => {
                        debug!(connection = %info.id, peer = %peer, "TLS accept failed: {}", e);
                    }
                }
            } else {
                let mut conn =
                    Connection::new(socket, info.clone(), hosts, dispatcher, ring_capacity);
                if let Err(e) = conn.run().await {
                    tracing::error!(connection = %info.id, peer = %peer, "Connection error: {}", e);
                }
            }
        });
    }
}
