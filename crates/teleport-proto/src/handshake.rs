//! Control handshake
//!
//! A client opens a TCP connection and sends a plain HTTP/1.1 `GET /` carrying its
//! credentials (and, in the encrypted variant, its ephemeral public key). The server
//! answers with a status line and, on success, the assigned public host and its own
//! ephemeral public key. After a `200 OK` both sides stop speaking HTTP and the same
//! TCP connection carries multiplexer frames.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::MAX_HEAD_SIZE;

pub const HEADER_USERNAME: &str = "X-Username";
pub const HEADER_PASSWORD: &str = "X-Password";
pub const HEADER_CLIENT_PUBLIC_KEY: &str = "X-Client-Public-Key";
pub const HEADER_PUBLIC_HOST: &str = "X-Public-Host";
pub const HEADER_SERVER_PUBLIC_KEY: &str = "X-Server-Public-Key";

const MAX_HEADERS: usize = 64;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error("Handshake head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Malformed handshake: {0}")]
    Malformed(String),
}

/// Control handshake request sent by the tunnel agent
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ControlRequest {
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_public_key: Option<String>,
}

impl std::fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRequest")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_public_key", &self.client_public_key)
            .finish()
    }
}

impl ControlRequest {
    /// Parse a complete request head.
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HandshakeError::Malformed("incomplete request".to_string()))
            }
            Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
        }

        let header = |name: &str| header_value(request.headers, name);
        Ok(Self {
            host: header("Host"),
            username: header(HEADER_USERNAME),
            password: header(HEADER_PASSWORD),
            client_public_key: header(HEADER_CLIENT_PUBLIC_KEY),
        })
    }

    /// Encode the request head
    pub fn encode(&self) -> Vec<u8> {
        let mut head = String::from("GET / HTTP/1.1\r\n");
        push_header(&mut head, "Host", self.host.as_deref());
        push_header(&mut head, HEADER_USERNAME, self.username.as_deref());
        push_header(&mut head, HEADER_PASSWORD, self.password.as_deref());
        push_header(
            &mut head,
            HEADER_CLIENT_PUBLIC_KEY,
            self.client_public_key.as_deref(),
        );
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Control handshake response sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: u16,
    pub public_host: Option<String>,
    pub server_public_key: Option<String>,
    pub message: Option<String>,
}

impl ControlResponse {
    pub fn ok(public_host: String, server_public_key: Option<String>) -> Self {
        Self {
            status: 200,
            public_host: Some(public_host),
            server_public_key,
            message: None,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            public_host: None,
            server_public_key: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Encode the response, including a text body for errors
    pub fn encode(&self) -> Vec<u8> {
        let body = self.message.as_deref().unwrap_or("");
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        push_header(&mut head, HEADER_PUBLIC_HOST, self.public_host.as_deref());
        push_header(
            &mut head,
            HEADER_SERVER_PUBLIC_KEY,
            self.server_public_key.as_deref(),
        );
        if !body.is_empty() {
            head.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        head.push_str("Connection: close\r\n\r\n");
        head.push_str(body);
        head.into_bytes()
    }

    /// Parse a complete response head. The body, if any, is not part of `head`.
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HandshakeError::Malformed("incomplete response".to_string()))
            }
            Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
        }

        let status = response
            .code
            .ok_or_else(|| HandshakeError::Malformed("missing status code".to_string()))?;
        Ok(Self {
            status,
            public_host: header_value(response.headers, HEADER_PUBLIC_HOST),
            server_public_key: header_value(response.headers, HEADER_SERVER_PUBLIC_KEY),
            message: None,
        })
    }

    fn content_length(head: &[u8]) -> usize {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        if response.parse(head).is_err() {
            return 0;
        }
        header_value(response.headers, "Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// Read a request head from `reader`.
///
/// Bytes read past the end of the head stay in `buf`; they already belong to
/// whatever protocol follows the handshake.
pub async fn read_request<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<ControlRequest, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let head = read_head(reader, buf).await?;
    ControlRequest::parse(&head)
}

/// Read a response from `reader`, including its body.
///
/// Error bodies are surfaced through [`ControlResponse::message`]. Bytes read past
/// the end of the response stay in `buf`.
pub async fn read_response<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<ControlResponse, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let head = read_head(reader, buf).await?;
    let mut response = ControlResponse::parse(&head)?;

    let body_len = ControlResponse::content_length(&head).min(MAX_HEAD_SIZE);
    while buf.len() < body_len {
        if reader.read_buf(buf).await? == 0 {
            break;
        }
    }
    let body = buf.split_to(body_len.min(buf.len()));
    if !body.is_empty() {
        response.message = Some(String::from_utf8_lossy(&body).into_owned());
    }

    Ok(response)
}

async fn read_head<R>(reader: &mut R, buf: &mut BytesMut) -> Result<BytesMut, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut scanned = 0;
    loop {
        if let Some(end) = find_head_end(buf, scanned) {
            return Ok(buf.split_to(end));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HandshakeError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        // A terminator may straddle two reads.
        scanned = buf.len().saturating_sub(3);
        if reader.read_buf(buf).await? == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }
    }
}

/// Returns the length of the head including the blank line, if complete.
pub fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| from + pos + 4)
}

fn header_value(headers: &[httparse::Header<'_>], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn push_header(head: &mut String, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
