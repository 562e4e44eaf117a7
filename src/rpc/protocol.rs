//! Wire protocol for the provider/client pair
//!
//! Requests are a single header line followed by an optional
//! length-prefixed value:
//!
//! ```text
//! <provider_id> <method> <key>\r\n                          (fetch, delete)
//! <provider_id> <method> <key> <value_len>\r\n<value>\r\n   (insert, update)
//! ```
//!
//! Responses reuse the familiar reply framing: `$<len>\r\n<bytes>\r\n`
//! for a fetched value, `:<status>\r\n` for mutations (1 success,
//! 0 failure) and `-<message>\r\n` for protocol-level errors. A fetch of
//! a missing key answers with the bulk string `"key not found"`; that
//! sentinel is part of the wire contract and is normalized back to an
//! error kind by the client.

use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Legacy sentinel carried on the wire for a missing fetch.
pub const FETCH_MISSING_SENTINEL: &[u8] = b"key not found";

/// Upper bound on a single value frame.
const MAX_VALUE_LEN: usize = 1 << 30;

/// The four provider methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Fetch,
    Insert,
    Update,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Fetch => "kv_fetch",
            Method::Insert => "kv_insert",
            Method::Update => "kv_update",
            Method::Delete => "kv_delete",
        }
    }

    pub fn parse(s: &str) -> Option<Method> {
        match s {
            "kv_fetch" => Some(Method::Fetch),
            "kv_insert" => Some(Method::Insert),
            "kv_update" => Some(Method::Update),
            "kv_delete" => Some(Method::Delete),
            _ => None,
        }
    }

    /// Whether the method carries a value payload.
    pub fn takes_value(&self) -> bool {
        matches!(self, Method::Insert | Method::Update)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub provider_id: u16,
    pub method: Method,
    pub key: i32,
    pub value: Option<Vec<u8>>,
}

/// One response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Bulk reply to a fetch
    Value(Vec<u8>),
    /// Status reply to a mutation
    Status(i32),
    /// Protocol-level failure
    Error(String),
}

/// Server side: decodes requests, encodes responses.
pub struct ServerCodec;

/// Client side: encodes requests, decodes responses.
pub struct ClientCodec;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn find_crlf(src: &[u8], start: usize) -> Option<usize> {
    if src.len() < 2 {
        return None;
    }
    (start..src.len() - 1).find(|&i| src[i] == b'\r' && src[i + 1] == b'\n')
}

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, io::Error> {
        let header_end = match find_crlf(src, 0) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let header = std::str::from_utf8(&src[..header_end])
            .map_err(|_| invalid("request header is not utf-8"))?;
        let parts: Vec<&str> = header.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(invalid(format!("short request header: {header:?}")));
        }

        let provider_id: u16 = parts[0]
            .parse()
            .map_err(|_| invalid("bad provider id in request"))?;
        let method =
            Method::parse(parts[1]).ok_or_else(|| invalid(format!("unknown method {}", parts[1])))?;
        let key: i32 = parts[2].parse().map_err(|_| invalid("bad key in request"))?;

        if method.takes_value() {
            if parts.len() != 4 {
                return Err(invalid(format!("{method} requires a value length")));
            }
            let len: usize = parts[3]
                .parse()
                .map_err(|_| invalid("bad value length in request"))?;
            if len > MAX_VALUE_LEN {
                return Err(invalid(format!("value of {len} bytes exceeds frame limit")));
            }

            let frame_end = header_end + 2 + len + 2;
            if src.len() < frame_end {
                src.reserve(frame_end - src.len());
                return Ok(None);
            }
            if &src[frame_end - 2..frame_end] != b"\r\n" {
                return Err(invalid("value payload is not CRLF-terminated"));
            }
            let value = src[header_end + 2..header_end + 2 + len].to_vec();
            src.advance(frame_end);
            Ok(Some(Request {
                provider_id,
                method,
                key,
                value: Some(value),
            }))
        } else {
            if parts.len() != 3 {
                return Err(invalid(format!("{method} takes no value")));
            }
            src.advance(header_end + 2);
            Ok(Some(Request {
                provider_id,
                method,
                key,
                value: None,
            }))
        }
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), io::Error> {
        match item {
            Response::Value(bytes) => {
                dst.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
                dst.extend_from_slice(&bytes);
                dst.extend_from_slice(b"\r\n");
            }
            Response::Status(status) => {
                dst.extend_from_slice(format!(":{status}\r\n").as_bytes());
            }
            Response::Error(msg) => {
                dst.extend_from_slice(format!("-{msg}\r\n").as_bytes());
            }
        }
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, io::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match src[0] {
            b'$' => {
                let len_end = match find_crlf(src, 1) {
                    Some(pos) => pos,
                    None => return Ok(None),
                };
                let len: usize = std::str::from_utf8(&src[1..len_end])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| invalid("bad bulk length"))?;
                if len > MAX_VALUE_LEN {
                    return Err(invalid("bulk reply exceeds frame limit"));
                }
                let data_start = len_end + 2;
                let frame_end = data_start + len + 2;
                if src.len() < frame_end {
                    src.reserve(frame_end - src.len());
                    return Ok(None);
                }
                if &src[frame_end - 2..frame_end] != b"\r\n" {
                    return Err(invalid("bulk reply is not CRLF-terminated"));
                }
                let bytes = src[data_start..data_start + len].to_vec();
                src.advance(frame_end);
                Ok(Some(Response::Value(bytes)))
            }
            b':' => {
                let end = match find_crlf(src, 1) {
                    Some(pos) => pos,
                    None => return Ok(None),
                };
                let status: i32 = std::str::from_utf8(&src[1..end])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| invalid("bad status reply"))?;
                src.advance(end + 2);
                Ok(Some(Response::Status(status)))
            }
            b'-' => {
                let end = match find_crlf(src, 1) {
                    Some(pos) => pos,
                    None => return Ok(None),
                };
                let msg = String::from_utf8_lossy(&src[1..end]).to_string();
                src.advance(end + 2);
                Ok(Some(Response::Error(msg)))
            }
            other => Err(invalid(format!("unknown reply type 0x{other:02x}"))),
        }
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), io::Error> {
        match &item.value {
            Some(value) => {
                dst.extend_from_slice(
                    format!(
                        "{} {} {} {}\r\n",
                        item.provider_id,
                        item.method,
                        item.key,
                        value.len()
                    )
                    .as_bytes(),
                );
                dst.extend_from_slice(value);
                dst.extend_from_slice(b"\r\n");
            }
            None => {
                dst.extend_from_slice(
                    format!("{} {} {}\r\n", item.provider_id, item.method, item.key).as_bytes(),
                );
            }
        }
        Ok(())
    }
}
