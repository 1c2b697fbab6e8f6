//! Front-end HTTP/1.1 plumbing: request/response head parsing on top of
//! httparse, body framing, and synthesized replies for backend failures.

use std::io::{self, Error, ErrorKind};

use burrow_proto::event::{HttpRequestEvent, HttpResponseEvent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Request and response heads larger than this are refused.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

fn invalid_data(msg: &str) -> Error {
    Error::new(ErrorKind::InvalidData, msg.to_string())
}

/// Reads buffered bytes until a blank line terminates the head. Returns
/// `None` on a clean EOF before the first byte.
async fn read_head<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head: Vec<u8> = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(ErrorKind::UnexpectedEof.into());
        }
        let chunk_len = chunk.len();
        let already = head.len();
        // Search across the chunk boundary; the terminator may straddle it.
        head.extend_from_slice(chunk);
        match find_head_end(&head) {
            Some(end) => {
                // Consume only the head. Bytes past it stay buffered; they
                // belong to the body or to the next pipelined request.
                reader.consume(end - already);
                head.truncate(end);
                return Ok(Some(head));
            }
            None => {
                reader.consume(chunk_len);
                if head.len() > MAX_HEAD_SIZE {
                    return Err(invalid_data("request head too large"));
                }
            }
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn content_length(headers: &[(String, String)]) -> io::Result<Option<usize>> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("Content-Length") {
            let len: usize = value
                .trim()
                .parse()
                .map_err(|_| invalid_data("bad Content-Length"))?;
            if len > MAX_BODY_SIZE {
                return Err(invalid_data("body too large"));
            }
            return Ok(Some(len));
        }
    }
    Ok(None)
}

/// Parses one request from the stream into a normalized event with
/// `hash` as its correlation id. `Ok(None)` means the client closed the
/// connection between requests.
pub async fn read_request<R>(reader: &mut R, hash: u32) -> io::Result<Option<HttpRequestEvent>>
where
    R: AsyncBufRead + Unpin,
{
    let raw = match read_head(reader).await? {
        Some(raw) => raw,
        None => return Ok(None),
    };

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);
    match parsed
        .parse(&raw)
        .map_err(|e| invalid_data(&format!("bad request head: {e}")))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(invalid_data("incomplete request head")),
    }

    let mut ev = HttpRequestEvent {
        method: parsed.method.unwrap_or("").to_string(),
        url: parsed.path.unwrap_or("").to_string(),
        headers: parsed
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
        content: Vec::new(),
        hash,
    };

    if let Some(len) = content_length(&ev.headers)? {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        ev.content = body;
    }

    Ok(Some(ev))
}

/// Parses one HTTP/1.1 response from a backend socket.
pub async fn read_response<R>(reader: &mut R, hash: u32) -> io::Result<HttpResponseEvent>
where
    R: AsyncBufRead + Unpin,
{
    let raw = read_head(reader)
        .await?
        .ok_or_else(|| Error::from(ErrorKind::UnexpectedEof))?;

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    match parsed
        .parse(&raw)
        .map_err(|e| invalid_data(&format!("bad response head: {e}")))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(invalid_data("incomplete response head")),
    }

    let mut ev = HttpResponseEvent {
        status: u32::from(parsed.code.unwrap_or(0)),
        headers: parsed
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
        content: Vec::new(),
        hash,
    };

    let mut body = Vec::new();
    if let Some(len) = content_length(&ev.headers)? {
        body.resize(len, 0);
        reader.read_exact(&mut body).await?;
    } else if is_chunked(&ev.headers) {
        read_chunked(reader, &mut body).await?;
        ev.remove_transfer_encoding();
        ev.set_header("Content-Length", &body.len().to_string());
    } else {
        // No framing declared; the server signals the end by closing.
        reader.read_to_end(&mut body).await?;
    }
    ev.content = body;
    Ok(ev)
}

trait ResponseHeaderExt {
    fn remove_transfer_encoding(&mut self);
}

impl ResponseHeaderExt for HttpResponseEvent {
    fn remove_transfer_encoding(&mut self) {
        self.headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case("Transfer-Encoding"));
    }
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(n, v)| {
        n.eq_ignore_ascii_case("Transfer-Encoding") && v.to_ascii_lowercase().contains("chunked")
    })
}

/// Reads a chunked body off the stream and concatenates the chunks.
async fn read_chunked<R>(reader: &mut R, body: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffered = std::mem::take(body);
    loop {
        let line = read_line(reader, &mut buffered).await?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| invalid_data("bad chunk size"))?;
        if body.len() + size > MAX_BODY_SIZE {
            return Err(invalid_data("body too large"));
        }
        if size == 0 {
            // Trailer section up to the final blank line.
            loop {
                let trailer = read_line(reader, &mut buffered).await?;
                if trailer.is_empty() {
                    return Ok(());
                }
            }
        }
        let mut chunk = vec![0u8; size];
        read_exact_buffered(reader, &mut buffered, &mut chunk).await?;
        body.extend_from_slice(&chunk);
        let sep = read_line(reader, &mut buffered).await?;
        if !sep.is_empty() {
            return Err(invalid_data("missing chunk terminator"));
        }
    }
}

async fn read_line<R>(reader: &mut R, buffered: &mut Vec<u8>) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        if let Some(i) = buffered.windows(2).position(|w| w == b"\r\n") {
            let line = buffered.drain(..i + 2).take(i).collect::<Vec<u8>>();
            return String::from_utf8(line).map_err(|_| invalid_data("non-UTF-8 chunk line"));
        }
        if buffered.len() > MAX_HEAD_SIZE {
            return Err(invalid_data("chunk line too long"));
        }
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        buffered.extend_from_slice(chunk);
        let n = chunk.len();
        reader.consume(n);
    }
}

async fn read_exact_buffered<R>(
    reader: &mut R,
    buffered: &mut Vec<u8>,
    out: &mut [u8],
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let from_buffer = buffered.len().min(out.len());
    out[..from_buffer].copy_from_slice(&buffered[..from_buffer]);
    buffered.drain(..from_buffer);
    if from_buffer < out.len() {
        reader.read_exact(&mut out[from_buffer..]).await?;
    }
    Ok(())
}

/// Builds a response the proxy fabricates itself when no backend answer is
/// available.
pub fn synthesize(status: u32, body: &str, hash: u32) -> HttpResponseEvent {
    HttpResponseEvent {
        status,
        headers: vec![
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
            ("Connection".to_string(), "close".to_string()),
        ],
        content: body.as_bytes().to_vec(),
        hash,
    }
}

/// Resolves where a request wants to go, as `host:port`.
pub fn target_address(ev: &HttpRequestEvent) -> Option<String> {
    if ev.method.eq_ignore_ascii_case("CONNECT") {
        return Some(with_default_port(&ev.url, 443));
    }
    if let Some(rest) = ev.url.strip_prefix("http://") {
        let authority = rest.split('/').next().unwrap_or(rest);
        if !authority.is_empty() {
            return Some(with_default_port(authority, 80));
        }
    }
    ev.header("Host").map(|host| with_default_port(host, 80))
}

fn with_default_port(authority: &str, default_port: u16) -> String {
    // rsplit keeps IPv6-literal colons out of the port check.
    match authority.rsplit_once(':') {
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            authority.to_string()
        }
        _ => format!("{authority}:{default_port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_simple_get() {
        let raw = b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let ev = read_request(&mut reader, 7).await.unwrap().unwrap();
        assert_eq!(ev.method, "GET");
        assert_eq!(ev.url, "http://example.com/path");
        assert_eq!(ev.header("host"), Some("example.com"));
        assert_eq!(ev.hash, 7);
        assert!(ev.content.is_empty());
    }

    #[tokio::test]
    async fn parses_body_by_content_length() {
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufReader::new(&raw[..]);
        let ev = read_request(&mut reader, 1).await.unwrap().unwrap();
        assert_eq!(ev.content, b"hello");
    }

    #[tokio::test]
    async fn pipelined_requests_both_parse() {
        let raw = b"GET /first HTTP/1.1\r\nHost: a\r\n\r\nGET /second HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let first = read_request(&mut reader, 1).await.unwrap().unwrap();
        assert_eq!(first.url, "/first");
        let second = read_request(&mut reader, 2).await.unwrap().unwrap();
        assert_eq!(second.url, "/second");
        assert!(read_request(&mut reader, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn body_does_not_swallow_the_next_pipelined_request() {
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /next HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let post = read_request(&mut reader, 1).await.unwrap().unwrap();
        assert_eq!(post.content, b"hello");
        let get = read_request(&mut reader, 2).await.unwrap().unwrap();
        assert_eq!(get.method, "GET");
        assert_eq!(get.url, "/next");
    }

    #[tokio::test]
    async fn eof_between_requests_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request(&mut reader, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_head_is_an_error() {
        let raw = b"\x00\x01\x02garbage\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request(&mut reader, 1).await.is_err());
    }

    #[tokio::test]
    async fn parses_response_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut reader = BufReader::new(&raw[..]);
        let ev = read_response(&mut reader, 3).await.unwrap();
        assert_eq!(ev.status, 200);
        assert_eq!(ev.content, b"ok");
        assert_eq!(ev.hash, 3);
    }

    #[tokio::test]
    async fn dechunks_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let ev = read_response(&mut reader, 0).await.unwrap();
        assert_eq!(ev.content, b"hello world");
        assert_eq!(ev.header("Content-Length"), Some("11"));
        assert!(ev.header("Transfer-Encoding").is_none());
    }

    #[tokio::test]
    async fn response_without_framing_reads_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\neverything until close";
        let mut reader = BufReader::new(&raw[..]);
        let ev = read_response(&mut reader, 0).await.unwrap();
        assert_eq!(ev.content, b"everything until close");
    }

    #[test]
    fn synthesized_response_is_closed_and_sized() {
        let ev = synthesize(503, "no backend", 9);
        assert_eq!(ev.status, 503);
        assert_eq!(ev.header("Content-Length"), Some("10"));
        assert_eq!(ev.header("Connection"), Some("close"));
    }

    #[test]
    fn target_address_variants() {
        let connect = HttpRequestEvent {
            method: "CONNECT".to_string(),
            url: "example.com:8443".to_string(),
            ..Default::default()
        };
        assert_eq!(target_address(&connect).as_deref(), Some("example.com:8443"));

        let absolute = HttpRequestEvent {
            method: "GET".to_string(),
            url: "http://example.com/x".to_string(),
            ..Default::default()
        };
        assert_eq!(target_address(&absolute).as_deref(), Some("example.com:80"));

        let mut relative = HttpRequestEvent {
            method: "GET".to_string(),
            url: "/x".to_string(),
            ..Default::default()
        };
        relative.set_header("Host", "example.com:8080");
        assert_eq!(target_address(&relative).as_deref(), Some("example.com:8080"));

        let nowhere = HttpRequestEvent::default();
        assert_eq!(target_address(&nowhere), None);
    }
}
