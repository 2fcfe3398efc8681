//! HTTP/1.1 wire codec for the client-facing leg.
//!
//! Hand-rolled request parsing over buffered tokio streams: request line,
//! ordered headers, Content-Length and chunked bodies. Responses are
//! serialized with content-length framing when the length is known and
//! re-chunked when streaming an unbounded upstream body.

use crate::error::ProxyError;
use crate::Result;
use proxy_common::Headers;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_BLOCK: usize = 64 * 1024;
const MAX_CHUNK_SIZE_LINE: usize = 128;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Raw request target: origin-form, absolute-form, or authority-form
    /// for CONNECT.
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.headers.get("connection").map(|v| v.to_ascii_lowercase());
        match self.version.as_str() {
            "HTTP/1.0" => connection.as_deref() == Some("keep-alive"),
            _ => connection.as_deref() != Some("close"),
        }
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
            && self
                .headers
                .get_all("connection")
                .any(|v| v.to_ascii_lowercase().contains("upgrade"))
    }
}

/// Read a request head. `Ok(None)` means the client closed the connection
/// cleanly before sending another request.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let request_line = match read_line(reader, MAX_REQUEST_LINE).await? {
        Some(line) => line,
        None => return Ok(None),
    };
    if request_line.is_empty() {
        return Ok(None);
    }

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::ClientProtocol(format!(
            "invalid request line: {:?}",
            request_line
        )));
    };
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::ClientProtocol(format!(
            "invalid HTTP version: {:?}",
            version
        )));
    }

    let headers = read_headers(reader).await?;
    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    }))
}

/// Read the header block into the ordered multimap.
pub async fn read_headers<R>(reader: &mut R) -> Result<Headers>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    let mut total = 0usize;
    loop {
        let line = read_line(reader, MAX_HEADER_BLOCK).await?.ok_or_else(|| {
            ProxyError::ClientProtocol("connection closed inside header block".to_string())
        })?;
        if line.is_empty() {
            return Ok(headers);
        }
        total += line.len();
        if total > MAX_HEADER_BLOCK {
            return Err(ProxyError::ClientProtocol("header block too large".to_string()));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProxyError::ClientProtocol(format!(
                "malformed header line: {:?}",
                line
            )));
        };
        headers.push(name.trim().to_string(), value.trim().to_string());
    }
}

/// Read a request body according to the framing headers. Returns the full
/// body; the recorder applies the storage cap separately so forwarding
/// stays byte-exact.
pub async fn read_body<R>(reader: &mut R, headers: &Headers) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    if headers.is_chunked() {
        return read_chunked_body(reader).await;
    }
    match headers.content_length() {
        Some(0) | None => Ok(Vec::new()),
        Some(length) => {
            let mut body = vec![0u8; length];
            reader
                .read_exact(&mut body)
                .await
                .map_err(|e| ProxyError::ClientProtocol(format!("body read failed: {}", e)))?;
            Ok(body)
        }
    }
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let size_line = read_line(reader, MAX_CHUNK_SIZE_LINE)
            .await?
            .ok_or_else(|| ProxyError::ClientProtocol("eof inside chunked body".to_string()))?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| {
            ProxyError::ClientProtocol(format!("invalid chunk size: {:?}", size_str))
        })?;

        if size == 0 {
            // Trailer section up to the blank line.
            loop {
                let trailer = read_line(reader, MAX_HEADER_BLOCK).await?.ok_or_else(|| {
                    ProxyError::ClientProtocol("eof inside chunk trailers".to_string())
                })?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(|e| ProxyError::ClientProtocol(format!("chunk read failed: {}", e)))?;

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .map_err(|e| ProxyError::ClientProtocol(format!("chunk delimiter read failed: {}", e)))?;
        if &crlf != b"\r\n" {
            return Err(ProxyError::ClientProtocol("missing chunk delimiter".to_string()));
        }
    }
}

/// Read one CRLF (or bare LF) terminated line without the terminator.
/// `Ok(None)` on immediate EOF.
async fn read_line<R>(reader: &mut R, limit: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let n = reader
        .take((limit + 2) as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if !raw.ends_with(b"\n") {
        return Err(ProxyError::ClientProtocol("line too long".to_string()));
    }
    while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
        raw.pop();
    }
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

/// Serialize and send a response head.
pub async fn write_response_head<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    headers: &Headers,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes();
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one chunk in chunked transfer encoding.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

pub async fn write_chunk_end<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"0\r\n\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Send a synthetic response (400/403/502 and friends) with a short body.
pub async fn write_simple_response<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = Headers::new();
    headers.push("Content-Type", "text/plain; charset=utf-8");
    headers.push("Content-Length", body.len().to_string());
    headers.push("Connection", "close");
    write_response_head(writer, status, reason, &headers).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        101 => "Switching Protocols",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// A stream that replays already-consumed bytes before the inner stream.
/// Used when buffered bytes must be handed to a TLS acceptor or a
/// passthrough tunnel.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn parse(raw: &str) -> Result<Option<RequestHead>> {
        let mut reader = BufReader::new(Cursor::new(raw.as_bytes().to_vec()));
        read_request_head(&mut reader).await
    }

    #[tokio::test]
    async fn parses_request_line_and_ordered_headers() {
        let head = parse(
            "GET /path?x=1 HTTP/1.1\r\nHost: a.test\r\nX-One: 1\r\nX-One: 2\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/path?x=1");
        assert_eq!(head.version, "HTTP/1.1");
        let pairs: Vec<_> = head.headers.iter().collect();
        assert_eq!(
            pairs,
            vec![("Host", "a.test"), ("X-One", "1"), ("X-One", "2")]
        );
    }

    #[tokio::test]
    async fn eof_before_request_is_none() {
        assert!(parse("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_request_line_is_protocol_error() {
        assert!(matches!(
            parse("NONSENSE\r\n\r\n").await,
            Err(ProxyError::ClientProtocol(_))
        ));
        assert!(matches!(
            parse("GET / FTP/1.0\r\n\r\n").await,
            Err(ProxyError::ClientProtocol(_))
        ));
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut reader = BufReader::new(Cursor::new(raw));
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        let body = read_body(&mut reader, &head.headers).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn decodes_chunked_body() {
        let raw =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
                .to_vec();
        let mut reader = BufReader::new(Cursor::new(raw));
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        let body = read_body(&mut reader, &head.headers).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn connect_and_keep_alive_detection() {
        let head = parse("CONNECT h.test:443 HTTP/1.1\r\nHost: h.test:443\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(head.is_connect());
        assert!(head.wants_keep_alive());

        let head = parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(!head.wants_keep_alive());

        let head = parse("GET / HTTP/1.0\r\n\r\n").await.unwrap().unwrap();
        assert!(!head.wants_keep_alive());
    }

    #[tokio::test]
    async fn websocket_upgrade_detection() {
        let head = parse(
            "GET /chat HTTP/1.1\r\nHost: h\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        assert!(head.is_websocket_upgrade());
    }

    #[tokio::test]
    async fn prefixed_stream_replays_buffer_first() {
        let inner = Cursor::new(b"world".to_vec());
        let mut stream = PrefixedStream::new(b"hello ".to_vec(), inner);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn simple_response_is_well_formed() {
        let mut out = Vec::new();
        write_simple_response(&mut out, 403, "Forbidden", "blocked by rule")
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Content-Length: 15"));
        assert!(text.ends_with("blocked by rule"));
    }

    #[tokio::test]
    async fn chunk_writer_frames_correctly() {
        let mut out = Vec::new();
        write_chunk(&mut out, b"abc").await.unwrap();
        write_chunk_end(&mut out).await.unwrap();
        assert_eq!(out, b"3\r\nabc\r\n0\r\n\r\n");
    }
}
