use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::logging::AccessLogBuilder;
use crate::proxy::fetch::{self, FetchRequest};
use crate::proxy::{AppContext, request, response};

/// Serve one client connection: parse the request, attach to (or create) the
/// cache entry for its key, then stream the entry's bytes as they arrive.
///
/// Every exit path releases the entry exactly once via the handle's scoped
/// drop, and every failure path answers the client with a well-formed body
/// before closing.
pub async fn serve_client<S>(mut stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let settings = app.settings.clone();

    let head = match timeout(
        settings.client_timeout(),
        request::read_request_head(&mut stream, settings.max_header_size),
    )
    .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(err)) => {
            debug!(peer = %peer, error = %err, "failed to read request head");
            write_response(&mut stream, response::BAD_REQUEST, settings.client_timeout()).await;
            AccessLogBuilder::new(peer)
                .outcome("PARSE_ERROR")
                .elapsed(started.elapsed())
                .error_detail(err.to_string())
                .log();
            return Ok(());
        }
        Err(_) => {
            debug!(peer = %peer, "timed out reading request head");
            write_response(&mut stream, response::BAD_REQUEST, settings.client_timeout()).await;
            AccessLogBuilder::new(peer)
                .outcome("PARSE_ERROR")
                .elapsed(started.elapsed())
                .error_detail("timed out reading request head")
                .log();
            return Ok(());
        }
    };

    let parsed = match request::parse_request_head(&head) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(peer = %peer, error = %err, "failed to parse request");
            write_response(&mut stream, response::BAD_REQUEST, settings.client_timeout()).await;
            AccessLogBuilder::new(peer)
                .outcome("PARSE_ERROR")
                .elapsed(started.elapsed())
                .error_detail(err.to_string())
                .log();
            return Ok(());
        }
    };

    let key = parsed.cache_key();
    let log = AccessLogBuilder::new(peer)
        .method(parsed.method.as_str())
        .host(parsed.host.clone())
        .port(parsed.port)
        .path(parsed.path.clone());

    if key.len() > settings.max_key_length {
        write_response(&mut stream, response::URI_TOO_LONG, settings.client_timeout()).await;
        log.outcome("KEY_TOO_LONG").elapsed(started.elapsed()).log();
        return Ok(());
    }

    let (handle, created) = match app.directory.lookup_or_create(&key) {
        Ok(pair) => pair,
        Err(err) => {
            debug!(peer = %peer, key, error = %err, "cache admission failed");
            write_response(
                &mut stream,
                response::SERVICE_UNAVAILABLE,
                settings.client_timeout(),
            )
            .await;
            log.outcome("CAPACITY")
                .elapsed(started.elapsed())
                .error_detail(err.to_string())
                .log();
            return Ok(());
        }
    };

    if created {
        fetch::spawn(
            FetchRequest {
                host: parsed.host.clone(),
                port: parsed.port,
                path: parsed.path.clone(),
            },
            handle.entry(),
            settings.clone(),
            app.shutdown.signal(),
        );
    }
    let cache_lookup = if created { "miss" } else { "hit" };

    // Readers always start at offset zero: an attachment made after the
    // fetcher has written N bytes still replays the full prefix.
    let mut sent = 0usize;
    let wait = settings.stream_wait_timeout();
    let shutdown = app.shutdown.signal();
    let outcome = loop {
        let snapshot = handle.read_from(sent);
        if !snapshot.bytes.is_empty() {
            match timeout(settings.client_timeout(), stream.write_all(&snapshot.bytes)).await {
                Ok(Ok(())) => {
                    sent = snapshot.offset;
                    continue;
                }
                _ => break "CLIENT_ABORT",
            }
        }
        if snapshot.status.is_terminal() {
            break "COMPLETED";
        }
        if shutdown.is_triggered() {
            break "SHUTDOWN";
        }
        handle.wait_for_progress(sent, wait).await;
    };

    stream.shutdown().await.ok();
    log.cache_lookup(cache_lookup)
        .outcome(outcome)
        .bytes_out(sent as u64)
        .elapsed(started.elapsed())
        .log();
    Ok(())
}

async fn write_response<S>(stream: &mut S, bytes: &[u8], deadline: Duration)
where
    S: AsyncWrite + Unpin,
{
    let _ = timeout(deadline, async {
        stream.write_all(bytes).await?;
        stream.shutdown().await
    })
    .await;
}
