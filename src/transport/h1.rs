//! Raw HTTP/1.x exchange.
//!
//! The request is written exactly as assembled by the caller. The response
//! head is parsed with httparse; the body is read separately so a failure
//! while reading it can be told apart from a failed exchange.

use bytes::Bytes;
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::response::{find_header, ResponseHead};
use crate::transport::connector::MaybeHttpsStream;

/// Maximum response header size (64KB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// Maximum decoded body size (64MB).
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// How the body of the current response is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

/// One HTTP/1.x connection, used for a single exchange.
pub struct H1Connection {
    stream: MaybeHttpsStream,
    /// Bytes read past the response head.
    buffer: Vec<u8>,
    framing: Framing,
}

impl H1Connection {
    pub fn new(stream: MaybeHttpsStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            framing: Framing::Empty,
        }
    }

    /// Write raw request bytes.
    pub async fn write_request(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| Error::http_protocol(format!("Failed to write request: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::http_protocol(format!("Failed to flush: {}", e)))
    }

    /// Read the response head, skipping interim 1xx responses.
    pub async fn read_head(
        &mut self,
        method: &Method,
        effective_url: &str,
    ) -> Result<ResponseHead> {
        let mut buffer = std::mem::take(&mut self.buffer);

        loop {
            while find_header_end(&buffer).is_none() {
                if buffer.len() >= MAX_HEADERS_SIZE {
                    return Err(Error::http_protocol("Response headers too large"));
                }
                let mut read_buf = vec![0u8; 8192];
                let n = self.stream.read(&mut read_buf).await.map_err(|e| {
                    Error::http_protocol(format!("Failed to read response: {}", e))
                })?;
                if n == 0 {
                    return Err(Error::http_protocol(
                        "Connection closed before response complete",
                    ));
                }
                buffer.extend_from_slice(&read_buf[..n]);
            }

            let (head, consumed) = parse_head(&buffer, effective_url)?;
            buffer.drain(..consumed);

            // 101 ends HTTP/1.x on this connection, so it is final.
            if (100..200).contains(&head.status) && head.status != 101 {
                continue;
            }

            self.framing = framing_for(&head, method)?;
            self.buffer = buffer;
            return Ok(head);
        }
    }

    /// Read the body of the response whose head was last read.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        let initial = std::mem::take(&mut self.buffer);
        match self.framing {
            Framing::Empty => Ok(Bytes::new()),
            Framing::Length(len) => self.read_fixed_body(&initial, len).await,
            Framing::Chunked => self.read_chunked_body(initial).await,
            Framing::UntilClose => self.read_until_close(&initial).await,
        }
    }

    /// Read body until connection close (EOF).
    async fn read_until_close(&mut self, initial: &[u8]) -> Result<Bytes> {
        let mut body = initial.to_vec();
        let mut read_buf = vec![0u8; 8192];
        loop {
            let n = self.stream.read(&mut read_buf).await.map_err(|e| {
                Error::http_protocol(format!("Failed to read body (close-delimited): {}", e))
            })?;
            if n == 0 {
                break;
            }
            if body.len() + n > MAX_BODY_SIZE {
                return Err(Error::http_protocol(format!(
                    "Close-delimited body exceeds {} bytes",
                    MAX_BODY_SIZE
                )));
            }
            body.extend_from_slice(&read_buf[..n]);
        }
        Ok(Bytes::from(body))
    }

    /// Read a fixed-length body.
    ///
    /// Per RFC 9112: If the connection closes before the indicated number
    /// of bytes is received, this is an incomplete message and an error.
    async fn read_fixed_body(&mut self, initial: &[u8], content_length: usize) -> Result<Bytes> {
        if content_length > MAX_BODY_SIZE {
            return Err(Error::http_protocol(format!(
                "Content-Length {} exceeds {} bytes",
                content_length, MAX_BODY_SIZE
            )));
        }
        let initial_len = initial.len().min(content_length);
        let mut body = Vec::with_capacity(content_length.min(MAX_HEADERS_SIZE));
        body.extend_from_slice(&initial[..initial_len]);

        while body.len() < content_length {
            let remaining = content_length - body.len();
            let mut chunk = vec![0u8; remaining.min(8192)];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| Error::http_protocol(format!("Failed to read body: {}", e)))?;

            if n == 0 {
                return Err(Error::http_protocol(format!(
                    "Connection closed before receiving full body (got {} of {} bytes)",
                    body.len(),
                    content_length
                )));
            }
            body.extend_from_slice(&chunk[..n]);
        }

        Ok(Bytes::from(body))
    }

    /// Read a chunked transfer-encoded body.
    ///
    /// Per RFC 9112 Section 7.1:
    /// chunked-body = *chunk last-chunk trailer-section CRLF
    async fn read_chunked_body(&mut self, initial: Vec<u8>) -> Result<Bytes> {
        let mut body = Vec::new();
        let mut buffer = initial;
        let mut read_buf = vec![0u8; 8192];

        loop {
            let (chunk_size, line_end) = loop {
                if let Some((size, end)) = find_chunk_size(&buffer) {
                    break (size, end);
                }
                let n = self.stream.read(&mut read_buf).await.map_err(|e| {
                    Error::http_protocol(format!("Failed to read chunk size: {}", e))
                })?;
                if n == 0 {
                    return Err(Error::http_protocol(
                        "Connection closed while reading chunk size",
                    ));
                }
                buffer.extend_from_slice(&read_buf[..n]);
            };

            buffer.drain(..line_end);

            if chunk_size == 0 {
                self.consume_trailers(&mut buffer).await?;
                break;
            }

            if chunk_size > MAX_BODY_SIZE - body.len() {
                return Err(Error::http_protocol(format!(
                    "Chunked body exceeds {} bytes (chunk of {} after {})",
                    MAX_BODY_SIZE,
                    chunk_size,
                    body.len()
                )));
            }
            let chunk_end = chunk_size
                .checked_add(2) // data + \r\n
                .ok_or_else(|| Error::http_protocol("chunk size overflow"))?;
            while buffer.len() < chunk_end {
                let n = self.stream.read(&mut read_buf).await.map_err(|e| {
                    Error::http_protocol(format!("Failed to read chunk data: {}", e))
                })?;
                if n == 0 {
                    return Err(Error::http_protocol(
                        "Connection closed while reading chunk data",
                    ));
                }
                buffer.extend_from_slice(&read_buf[..n]);
            }

            body.extend_from_slice(&buffer[..chunk_size]);
            buffer.drain(..chunk_end);
        }

        Ok(Bytes::from(body))
    }

    /// Consume trailer headers after the last chunk.
    async fn consume_trailers(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let mut read_buf = vec![0u8; 4096];

        loop {
            if let Some(pos) = find_crlf(buffer) {
                buffer.drain(..pos + 2);
                if pos == 0 {
                    return Ok(());
                }
                continue;
            }

            let n = self
                .stream
                .read(&mut read_buf)
                .await
                .map_err(|e| Error::http_protocol(format!("Failed to read trailers: {}", e)))?;
            if n == 0 {
                // Trailers may be absent when the server closes.
                return Ok(());
            }
            buffer.extend_from_slice(&read_buf[..n]);
        }
    }
}

/// Serialize a request: request line, headers in order, blank line, body.
pub fn build_request(
    method: &Method,
    target: &str,
    version: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut request = Vec::with_capacity(256 + body.len());

    request.extend_from_slice(method.as_str().as_bytes());
    request.push(b' ');
    request.extend_from_slice(target.as_bytes());
    request.push(b' ');
    request.extend_from_slice(version.as_bytes());
    request.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        request.extend_from_slice(name.as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    request.extend_from_slice(body);

    request
}

/// Parse a complete response head, returning it with the bytes consumed.
fn parse_head(buffer: &[u8], effective_url: &str) -> Result<(ResponseHead, usize)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut response = httparse::Response::new(&mut headers);

    let consumed = match response
        .parse(buffer)
        .map_err(|e| Error::http_protocol(format!("Failed to parse response: {}", e)))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            return Err(Error::http_protocol("Incomplete response headers"));
        }
    };

    let status = response
        .code
        .ok_or_else(|| Error::http_protocol("Missing status code"))?;

    let head = ResponseHead {
        status,
        reason: response.reason.unwrap_or_default().to_string(),
        version: format!("HTTP/1.{}", response.version.unwrap_or(1)),
        headers: response
            .headers
            .iter()
            .filter(|h| !h.name.is_empty())
            .map(|h| format!("{}: {}", h.name, String::from_utf8_lossy(h.value)))
            .collect(),
        effective_url: effective_url.to_string(),
    };
    Ok((head, consumed))
}

/// Body delimitation per RFC 9112 Section 6.3.
fn framing_for(head: &ResponseHead, method: &Method) -> Result<Framing> {
    if matches!(head.status, 100..=199 | 204 | 304) || *method == Method::HEAD {
        return Ok(Framing::Empty);
    }

    // Transfer-Encoding overrides Content-Length.
    if let Some(te) = find_header(&head.headers, "transfer-encoding") {
        let chunked = te
            .split(',')
            .next_back()
            .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        return Ok(if chunked { Framing::Chunked } else { Framing::UntilClose });
    }

    match find_header(&head.headers, "content-length") {
        Some(cl) => Ok(Framing::Length(parse_content_length(cl)?)),
        None => Ok(Framing::UntilClose),
    }
}

/// Find the end of HTTP headers (\r\n\r\n).
pub(crate) fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a chunk size from the buffer, returning (size, end_of_line_position).
fn find_chunk_size(buffer: &[u8]) -> Option<(usize, usize)> {
    let i = find_crlf(buffer)?;
    let line = String::from_utf8_lossy(&buffer[..i]);
    // Chunk extensions after ';' are ignored.
    let size_part = line.split(';').next()?;
    let size = usize::from_str_radix(size_part.trim(), 16).ok()?;
    Some((size, i + 2))
}

/// Find the first CRLF in a buffer, returning its position.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Parse and validate Content-Length header value per RFC 9112 Section 6.2.
///
/// If multiple values are present (comma-separated), they must all be identical.
fn parse_content_length(value: &str) -> Result<usize> {
    let mut parts = value.split(',').map(str::trim);
    let parse = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| Error::http_protocol(format!("Invalid Content-Length: {}", value)))
    };

    let first = parse(parts.next().unwrap_or_default())?;
    for part in parts {
        if parse(part)? != first {
            return Err(Error::http_protocol(format!(
                "Conflicting Content-Length values: {}",
                value
            )));
        }
    }
    Ok(first)
}
