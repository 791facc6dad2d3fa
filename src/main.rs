use std::sync::Arc;

use bastion::config::Config;
use bastion::http::generator::ResponseWriter;
use bastion::http::response::Response;
use bastion::server::Server;
use bastion::tls;
use bastion::vhost::{RequestContext, VirtualHost};

fn hello(_ctx: &RequestContext, writer: ResponseWriter) {
    writer.commit_buffered(Response::ok("Hello from bastion\n"));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let server = Server::new(&cfg);

    let mut host = VirtualHost::new("localhost", Arc::new(hello));
    if let Some(tls_cfg) = &cfg.tls {
        host = host.with_tls(tls::load_server_config(&tls_cfg.cert, &tls_cfg.key)?);
    }
    server.add_host(host);

    server.listen(&cfg.listen_addr, false).await?;
    if let Some(tls_addr) = &cfg.tls_listen_addr {
        server.listen(tls_addr, true).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.shutdown().await;

    Ok(())
}
