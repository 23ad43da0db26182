//! Binary framed request/response protocol for inter-node cache traffic.
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! +-----------+--------+------------------------------+
//! | u32 len   | u8 tag | body (len - 1 bytes)         |
//! +-----------+--------+------------------------------+
//! ```
//!
//! Requests carry a group name (u8 length prefix), a key (u32 length
//! prefix), and for `Set` a value (u32 length prefix). Responses carry a
//! value, an ack, a deletion flag, or an error string. All integers are
//! big-endian.
//!
//! # Example
//!
//! ```
//! use protocol_peer::{Request, Response};
//!
//! let mut buf = Vec::new();
//! Request::Get {
//!     group: "users".to_string(),
//!     key: "u:42".to_string(),
//! }
//! .encode(&mut buf);
//!
//! let (request, consumed) = Request::parse(&buf).unwrap();
//! assert_eq!(consumed, buf.len());
//! assert!(matches!(request, Request::Get { .. }));
//! ```

use bytes::{BufMut, Bytes};

/// Maximum group name length in bytes.
pub const MAX_GROUP_LEN: usize = 255;

/// Maximum key length in bytes (64 KiB).
pub const MAX_KEY_LEN: usize = 64 * 1024;

/// Maximum value length in bytes (16 MiB).
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on a single frame body.
const MAX_FRAME_LEN: usize = MAX_VALUE_LEN + MAX_KEY_LEN + MAX_GROUP_LEN + 64;

const OP_GET: u8 = 1;
const OP_SET: u8 = 2;
const OP_DELETE: u8 = 3;

const RESP_VALUE: u8 = 1;
const RESP_STORED: u8 = 2;
const RESP_DELETED: u8 = 3;
const RESP_ERROR: u8 = 4;

/// Parse error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    #[error("incomplete")]
    Incomplete,
    /// Malformed or over-limit frame.
    #[error("invalid frame")]
    Invalid,
}

/// A request addressed to the peer owning a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Fetch the value for `(group, key)`.
    Get { group: String, key: String },
    /// Replicate a write for `(group, key)`.
    Set {
        group: String,
        key: String,
        value: Bytes,
    },
    /// Remove `(group, key)`.
    Delete { group: String, key: String },
}

/// A response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Successful `Get`.
    Value(Bytes),
    /// Successful `Set`.
    Stored,
    /// `Delete` outcome: whether a live entry was removed.
    Deleted(bool),
    /// The peer could not serve the request.
    Error(String),
}

/// Incremental reader over a frame body. Truncation inside a complete
/// frame is `Invalid`, not `Incomplete`.
struct Body<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(n).ok_or(ParseError::Invalid)?;
        if end > self.data.len() {
            return Err(ParseError::Invalid);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn group(&mut self) -> Result<String, ParseError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ParseError::Invalid)
    }

    fn key(&mut self) -> Result<String, ParseError> {
        let len = self.u32()? as usize;
        if len > MAX_KEY_LEN {
            return Err(ParseError::Invalid);
        }
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ParseError::Invalid)
    }

    fn value(&mut self) -> Result<Bytes, ParseError> {
        let len = self.u32()? as usize;
        if len > MAX_VALUE_LEN {
            return Err(ParseError::Invalid);
        }
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn finish(&self) -> Result<(), ParseError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(ParseError::Invalid)
        }
    }
}

/// Split a length-prefixed frame body out of `data`.
///
/// Returns the body and total bytes consumed (prefix included).
fn frame(data: &[u8]) -> Result<(&[u8], usize), ParseError> {
    if data.len() < 4 {
        return Err(ParseError::Incomplete);
    }
    let body_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if body_len == 0 || body_len > MAX_FRAME_LEN {
        return Err(ParseError::Invalid);
    }
    if data.len() < 4 + body_len {
        return Err(ParseError::Incomplete);
    }
    Ok((&data[4..4 + body_len], 4 + body_len))
}

fn put_frame(buf: &mut Vec<u8>, body: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.put_u32(0);
    body(buf);
    let body_len = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&body_len.to_be_bytes());
}

impl Request {
    /// Append the encoded request to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_frame(buf, |buf| match self {
            Request::Get { group, key } => {
                buf.put_u8(OP_GET);
                put_group_key(buf, group, key);
            }
            Request::Set { group, key, value } => {
                buf.put_u8(OP_SET);
                put_group_key(buf, group, key);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
            Request::Delete { group, key } => {
                buf.put_u8(OP_DELETE);
                put_group_key(buf, group, key);
            }
        });
    }

    /// Parse one request frame, returning it and the bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let (body, consumed) = frame(data)?;
        let mut body = Body::new(body);

        let request = match body.u8()? {
            OP_GET => Request::Get {
                group: body.group()?,
                key: body.key()?,
            },
            OP_SET => Request::Set {
                group: body.group()?,
                key: body.key()?,
                value: body.value()?,
            },
            OP_DELETE => Request::Delete {
                group: body.group()?,
                key: body.key()?,
            },
            _ => return Err(ParseError::Invalid),
        };

        body.finish()?;
        Ok((request, consumed))
    }
}

fn put_group_key(buf: &mut Vec<u8>, group: &str, key: &str) {
    buf.put_u8(group.len().min(MAX_GROUP_LEN) as u8);
    buf.put_slice(&group.as_bytes()[..group.len().min(MAX_GROUP_LEN)]);
    buf.put_u32(key.len() as u32);
    buf.put_slice(key.as_bytes());
}

impl Response {
    /// Append the encoded response to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_frame(buf, |buf| match self {
            Response::Value(value) => {
                buf.put_u8(RESP_VALUE);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
            Response::Stored => buf.put_u8(RESP_STORED),
            Response::Deleted(deleted) => {
                buf.put_u8(RESP_DELETED);
                buf.put_u8(*deleted as u8);
            }
            Response::Error(message) => {
                buf.put_u8(RESP_ERROR);
                buf.put_u32(message.len() as u32);
                buf.put_slice(message.as_bytes());
            }
        });
    }

    /// Parse one response frame, returning it and the bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let (body, consumed) = frame(data)?;
        let mut body = Body::new(body);

        let response = match body.u8()? {
            RESP_VALUE => Response::Value(body.value()?),
            RESP_STORED => Response::Stored,
            RESP_DELETED => Response::Deleted(body.u8()? != 0),
            RESP_ERROR => {
                let len = body.u32()? as usize;
                let raw = body.take(len)?;
                let message =
                    String::from_utf8(raw.to_vec()).map_err(|_| ParseError::Invalid)?;
                Response::Error(message)
            }
            _ => return Err(ParseError::Invalid),
        };

        body.finish()?;
        Ok((response, consumed))
    }

    /// Returns true if this is an error response.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}
