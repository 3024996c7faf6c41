use std::net::SocketAddr;
use std::sync::Arc;
use syncmd_sync::{LocalReplica, Responder, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Accepts peer connections and answers their rounds
pub struct SyncServer {
    listener: TcpListener,
    replica: Arc<LocalReplica>,
}

impl SyncServer {
    pub async fn bind(addr: &str, replica: Arc<LocalReplica>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for peers on {}", listener.local_addr()?);
        Ok(Self { listener, replica })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to true. Each connection is
    /// served on its own task.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            debug!("Accepted connection from {}", remote);
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", remote, e);
                            }
                            let responder = Responder::new(self.replica.clone());
                            tokio::spawn(async move {
                                match responder.serve(stream).await {
                                    Ok(peer) => info!("Finished serving {} ({})", peer, remote),
                                    Err(e) => warn!("Session with {} ended with error: {}", remote, e),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Peer server stopped");
    }
}
