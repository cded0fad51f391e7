use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::proxy::{AppContext, stream};

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    info!(listen = %listener.local_addr()?, "listening for proxy connections");
    Ok(listener)
}

/// Accept loop. Each connection gets its own task; the loop itself exits as
/// soon as shutdown is triggered, leaving in-flight connections to unwind on
/// their own signals.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let mut shutdown = app.shutdown.signal();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        if let Err(err) = socket.set_nodelay(true) {
                            debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
                        }
                        let app = app.clone();
                        tokio::spawn(async move {
                            if let Err(err) = stream::serve_client(socket, peer, app).await {
                                warn!(peer = %peer, error = %err, "connection handler failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown.triggered() => {
                info!("listener stopping, shutdown triggered");
                return Ok(());
            }
        }
    }
}
