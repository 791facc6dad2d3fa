//! Server facade: binds listeners, wires virtual hosts to the connection
//! pipeline and owns the worker pool.

pub mod listener;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::vhost::{VirtualHost, VirtualHosts};

/// The embeddable server: virtual-host registry, admission-controlled
/// worker pool and any number of plain/TLS listeners.
pub struct Server {
    hosts: Arc<VirtualHosts>,
    dispatcher: Arc<Dispatcher>,
    ring_capacity: usize,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: &Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            hosts: Arc::new(VirtualHosts::new()),
            dispatcher: Arc::new(Dispatcher::new(config.workers, config.queue_depth)),
            ring_capacity: config.stream_buffer,
            shutdown,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn hosts(&self) -> &VirtualHosts {
        &self.hosts
    }

    pub fn add_host(&self, host: VirtualHost) {
        self.hosts.add(host);
    }

    /// Binds a listening socket and starts its accept loop.
    ///
    /// Returns the bound address once the socket is listening, or the bind
    /// error; useful with port 0.
    pub async fn listen(&self, addr: &str, tls: bool) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let local = listener.local_addr()?;
        info!("Listening on {} (tls: {})", local, tls);

        let handle = tokio::spawn(listener::run(
            listener,
            tls,
            Arc::clone(&self.hosts),
            Arc::clone(&self.dispatcher),
            self.ring_capacity,
            self.shutdown.subscribe(),
        ));
        self.listeners.lock().await.push(handle);
        Ok(local)
    }

    /// Stops all accept loops and waits for them. Existing connections
    /// finish their in-flight request; the worker pool joins when the
    /// server is dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut listeners = self.listeners.lock().await;
        for handle in listeners.drain(..) {
            let _ = handle.await;
        }
        info!("Server stopped");
    }
}
