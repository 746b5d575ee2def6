//! TCP accept loop.
//!
//! Binds the virtual cluster's listening address, accepts client
//! connections and hands each one to the frontend on its own task. A watch
//! channel signals shutdown so the embedding layer can stop the proxy
//! without tearing down the process.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ProxyConfig;
use crate::proxy::cluster::{NetFilter, VirtualCluster};
use crate::proxy::error::Result;
use crate::proxy::frontend;

/// Bind the address and run the proxy listener until the shutdown signal
/// fires.
pub async fn run(
    bind_addr: &str,
    cluster: VirtualCluster,
    net_filter: Arc<dyn NetFilter>,
    config: ProxyConfig,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    serve(listener, cluster, net_filter, config, shutdown_rx).await
}

/// Run the accept loop on an already-bound listener. Useful when the caller
/// needs the ephemeral port before the proxy starts serving.
pub async fn serve(
    listener: TcpListener,
    cluster: VirtualCluster,
    net_filter: Arc<dyn NetFilter>,
    config: ProxyConfig,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    config.validate()?;
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, cluster = %cluster.name, "proxy listener bound");
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        if cluster.log_network {
                            info!(%addr, "accepted connection");
                        }
                        let cluster = cluster.clone();
                        let net_filter = Arc::clone(&net_filter);
                        let config = config.clone();
                        let span = info_span!("conn", peer = %addr);
                        tokio::spawn(
                            async move {
                                if let Err(e) =
                                    frontend::handle_connection(socket, cluster, net_filter, config)
                                        .await
                                {
                                    if e.is_disconnect() {
                                        debug!(%e, "connection closed");
                                    } else {
                                        warn!(%e, "connection error");
                                    }
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(%e, "error accepting connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("listener received shutdown signal");
                    break;
                }
            }
        }
    }

    Ok(())
}
