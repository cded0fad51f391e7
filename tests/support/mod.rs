#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use teecache::cli::LogFormat;
use teecache::proxy::cache::CacheDirectory;
use teecache::proxy::{AppContext, listener};
use teecache::settings::Settings;
use teecache::shutdown::ShutdownCoordinator;

pub fn test_settings(listen: SocketAddr) -> Settings {
    Settings {
        listen,
        log: LogFormat::Text,
        max_entries: 16,
        client_timeout: 5,
        resolve_timeout: 2,
        origin_connect_timeout: 2,
        origin_timeout: 5,
        stream_wait_timeout_ms: 50,
        shutdown_grace: 2,
        max_header_size: 8 * 1024,
        max_key_length: 4096,
        stats_interval: 0,
    }
}

/// A full proxy instance on an ephemeral port, with direct access to its
/// cache directory and shutdown coordinator.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub directory: CacheDirectory,
    pub shutdown: ShutdownCoordinator,
    pub settings: Arc<Settings>,
    serve_task: JoinHandle<anyhow::Result<()>>,
}

impl ProxyHarness {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut Settings)) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut settings = test_settings(addr);
        tweak(&mut settings);
        let settings = Arc::new(settings);
        let directory = CacheDirectory::new(settings.max_entries);
        let shutdown = ShutdownCoordinator::new();
        let app = AppContext::new(settings.clone(), directory.clone(), shutdown.clone());
        let serve_task = tokio::spawn(listener::serve(listener, app));
        Self {
            addr,
            directory,
            shutdown,
            settings,
            serve_task,
        }
    }

    /// Send one absolute-form GET and read the full response.
    pub async fn get(&self, target: &str) -> Vec<u8> {
        raw_get(self.addr, target).await
    }

    /// Send raw bytes and read the full response, for malformed-request tests.
    pub async fn send_raw(&self, bytes: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    /// Trigger shutdown, stop the accept loop and drain the cache the way the
    /// process-level run loop does.
    pub async fn stop(self) {
        self.shutdown.trigger();
        self.serve_task.await.unwrap().unwrap();
        self.directory.drain(self.settings.shutdown_grace()).await;
    }
}

/// Standalone GET against a proxy address, usable from spawned tasks.
pub async fn raw_get(proxy: SocketAddr, target: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("GET {target} HTTP/1.0\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

/// Mock origin server. Serves every accepted connection with the configured
/// chunk sequence, sleeping `gap` between chunks, and counts accepts.
pub struct Origin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl Origin {
    pub async fn start(chunks: Vec<Vec<u8>>, gap: Duration) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn({
            let hits = hits.clone();
            async move {
                loop {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        return;
                    };
                    hits.fetch_add(1, Ordering::SeqCst);
                    let chunks = chunks.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        loop {
                            let n = stream.read(&mut buf).await.unwrap_or(0);
                            if n == 0 || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        for chunk in chunks {
                            if stream.write_all(&chunk).await.is_err() {
                                return;
                            }
                            tokio::time::sleep(gap).await;
                        }
                        stream.shutdown().await.ok();
                    });
                }
            }
        });
        Self {
            addr,
            hits,
            accept_task,
        }
    }

    /// A port that refuses connections: bound once, then released.
    pub async fn refused() -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Absolute-form request target for `path` on this origin. Uses the
    /// literal IP so no DNS lookup is involved.
    pub fn target(&self, path: &str) -> String {
        format!("http://{}:{}{path}", self.addr.ip(), self.addr.port())
    }
}

impl Drop for Origin {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
