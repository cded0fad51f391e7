use anyhow::{Context, Result, anyhow, bail};
use http::{Method, Uri};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Common representation of a proxied request after parsing the request line
/// and the Host header.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ParsedRequest {
    /// Cache key format: `"<host>:<port><path>"`, no scheme, path always
    /// starting with `/`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.path)
    }
}

const DEFAULT_HTTP_PORT: u16 = 80;

/// Read the request head (through the blank line) from the client, bounded by
/// `max_bytes`. Returns the raw head bytes.
pub async fn read_request_head<R>(reader: &mut R, max_bytes: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .context("reading request head from client")?;
        if n == 0 {
            bail!("client closed connection before completing request head");
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|window| window == b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > max_bytes {
            bail!("request head exceeds {max_bytes} byte limit");
        }
    }
}

/// Parse a raw request head into a normalized [`ParsedRequest`]. Accepts the
/// absolute-form target a proxy client sends (`GET http://host[:port]/path`)
/// and origin-form (`GET /path`) paired with a Host header. Only GET and HEAD
/// are supported.
pub fn parse_request_head(head: &[u8]) -> Result<ParsedRequest> {
    let text = std::str::from_utf8(head).context("request head is not valid UTF-8")?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("empty request line"))?
        .parse::<Method>()
        .context("invalid request method")?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("request line missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("request line missing HTTP version"))?;
    if !version.starts_with("HTTP/") {
        bail!("malformed HTTP version '{version}'");
    }

    if method != Method::GET && method != Method::HEAD {
        bail!("unsupported method '{method}'");
    }

    let host_header = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim());

    parse_target(method, target, host_header)
}

fn parse_target(method: Method, target: &str, host_header: Option<&str>) -> Result<ParsedRequest> {
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;

    if let Some(scheme) = uri.scheme_str() {
        if !scheme.eq_ignore_ascii_case("http") {
            bail!("unsupported scheme '{scheme}'");
        }
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("request target missing host"))?
            .to_ascii_lowercase();
        let port = uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT);
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        return Ok(ParsedRequest {
            method,
            host,
            port,
            path,
        });
    }

    if !target.starts_with('/') {
        bail!("request target must be absolute-form or origin-form");
    }
    let host_header =
        host_header.ok_or_else(|| anyhow!("origin-form request requires a Host header"))?;
    let (host, port) = parse_host_header(host_header)?;
    Ok(ParsedRequest {
        method,
        host,
        port,
        path: target.to_string(),
    })
}

/// Parse a Host header value into a normalized lowercase host and a port.
pub fn parse_host_header(value: &str) -> Result<(String, u16)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty Host header");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        bail!("Host header must not contain whitespace");
    }
    if trimmed.contains('/') || trimmed.contains('@') {
        bail!("Host header must not contain path or userinfo");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid Host header '{trimmed}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("Host header missing hostname"))?
        .to_ascii_lowercase();
    Ok((host, uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT)))
}
