use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::proxy::cache::CacheEntry;
use crate::proxy::{resolver, response};
use crate::settings::Settings;
use crate::shutdown::ShutdownSignal;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Ephemeral description of one origin fetch; owned by the fetcher task and
/// dropped when the transfer finishes.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Spawn the single background fetcher for a freshly created entry.
pub fn spawn(
    request: FetchRequest,
    entry: Arc<CacheEntry>,
    settings: Arc<Settings>,
    shutdown: ShutdownSignal,
) {
    tokio::spawn(run(request, entry, settings, shutdown));
}

/// Populate `entry` from the origin. Failures never propagate out of this
/// task; they become entry state (a cached 502 body and `Failed` status)
/// observed by consumers through the normal polling protocol.
pub async fn run(
    request: FetchRequest,
    entry: Arc<CacheEntry>,
    settings: Arc<Settings>,
    shutdown: ShutdownSignal,
) {
    let FetchRequest { host, port, path } = request;

    if shutdown.is_triggered() {
        entry.mark_failed();
        return;
    }

    let addrs = match resolver::resolve_host(&host, port, settings.resolve_timeout()).await {
        Ok(addrs) => addrs,
        Err(err) => {
            warn!(host, port, error = %err, "origin DNS resolution failed");
            entry.append(&response::dns_failure(&host));
            entry.mark_failed();
            return;
        }
    };

    let mut stream = match connect_to_addrs(&addrs, settings.origin_connect_timeout()).await {
        Ok((stream, addr)) => {
            debug!(host, port, origin = %addr, "connected to origin");
            stream
        }
        Err(err) => {
            warn!(host, port, error = %err, "origin connect failed");
            entry.append(&response::connect_failure(&host, port));
            entry.mark_failed();
            return;
        }
    };

    let request_bytes = origin_request(&path, &host);
    let send = timeout(settings.origin_timeout(), stream.write_all(&request_bytes)).await;
    if !matches!(send, Ok(Ok(()))) {
        warn!(host, port, "failed to send request to origin");
        entry.append(&response::send_failure(&host, port));
        entry.mark_failed();
        return;
    }

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut total = 0usize;
    loop {
        if shutdown.is_triggered() {
            debug!(key = %entry.key(), total, "fetch aborted by shutdown");
            entry.mark_failed();
            return;
        }
        match timeout(settings.origin_timeout(), stream.read(&mut buf)).await {
            Err(_) => {
                warn!(key = %entry.key(), total, "origin read stalled past deadline");
                entry.mark_failed();
                return;
            }
            Ok(Err(err)) => {
                warn!(key = %entry.key(), total, error = %err, "origin read failed");
                entry.mark_failed();
                return;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                total += n;
                if !entry.append(&buf[..n]) {
                    // Entry already failed underneath us (shutdown drain).
                    debug!(key = %entry.key(), "entry terminal, dropping remaining transfer");
                    return;
                }
            }
        }
    }

    debug!(key = %entry.key(), total, "origin transfer complete");
    entry.mark_complete();
}

/// The minimal HTTP/1.0 origin request. `Connection: close` turns end-of-body
/// detection into end-of-stream.
fn origin_request(path: &str, host: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.0\r\n\
         Host: {host}\r\n\
         User-Agent: teecache/0.1\r\n\
         Accept: */*\r\n\
         Connection: close\r\n\r\n"
    )
    .into_bytes()
}

/// Attempt each resolved address in turn, bounded by `connect_timeout`.
async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(origin = %addr, error = %err, "failed to set TCP_NODELAY on origin stream");
                }
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(
                    anyhow::Error::new(err).context(format!("failed to connect to {addr}")),
                );
            }
            Err(_) => {
                last_err = Some(anyhow::anyhow!("connection to {} timed out", addr));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no addresses provided for origin connect")))
}
