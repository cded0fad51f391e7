//! Synthesized HTTP/1.0 responses. Origin-side failures are cached in the
//! entry so repeat requests for a known-bad resource are answered from cache
//! instead of re-triggering fetches; client-side failures are written
//! directly to the one affected connection.

pub const BAD_REQUEST: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\r\n\
<html><body><h1>400 Bad Request</h1></body></html>";

pub const URI_TOO_LONG: &[u8] = b"HTTP/1.0 414 URI Too Long\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\r\n\
<html><body><h1>414 URI Too Long</h1></body></html>";

pub const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.0 503 Service Unavailable\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\r\n\
<html><body><h1>503 Service Unavailable</h1>\
<p>Cache is full, try again later</p></body></html>";

fn bad_gateway(detail: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 502 Bad Gateway\r\n\
         Content-Type: text/html\r\n\
         Connection: close\r\n\r\n\
         <html><body><h1>502 Bad Gateway</h1><p>{detail}</p></body></html>"
    )
    .into_bytes()
}

pub fn dns_failure(host: &str) -> Vec<u8> {
    bad_gateway(&format!("DNS resolution failed for {host}"))
}

pub fn connect_failure(host: &str, port: u16) -> Vec<u8> {
    bad_gateway(&format!("Connection failed to {host}:{port}"))
}

pub fn send_failure(host: &str, port: u16) -> Vec<u8> {
    bad_gateway(&format!("Failed to send request to {host}:{port}"))
}
