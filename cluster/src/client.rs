//! Persistent TCP session to one remote peer.

use crate::metrics::{PEER_ERRORS, PEER_REQUESTS, PEER_TIMEOUTS};
use async_trait::async_trait;
use bytes::Bytes;
use lattice::{Peer, TransportError};
use protocol_peer::{ParseError, Request, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default per-request deadline for `get` and `delete`. `set` runs under
/// the caller's deadline.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Default dial timeout.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client options.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// A [`Peer`] backed by one persistent TCP session.
///
/// The session is dialed on first use and redialed after any failure.
/// Requests on one client are serialized; the directory keeps one client
/// per peer address.
pub struct PeerClient {
    addr: String,
    options: ClientOptions,
    session: tokio::sync::Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl PeerClient {
    /// Create a client for `addr`. No connection is made until the first
    /// request.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_options(addr, ClientOptions::default())
    }

    pub(crate) fn with_options(addr: impl Into<String>, options: ClientOptions) -> Self {
        Self {
            addr: addr.into(),
            options,
            session: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The peer's address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let dial = TcpStream::connect(&self.addr);
        let stream = tokio::time::timeout(self.options.connect_timeout, dial)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(format!("{}: {e}", self.addr)))?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(addr = %self.addr, "peer session established");
        Ok(stream)
    }

    /// One request/response exchange on the persistent session. Any
    /// failure tears the session down so the next request redials.
    async fn exchange(&self, request: &Request) -> Result<Response, TransportError> {
        let mut session = self.session.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        if session.is_none() {
            *session = Some(self.connect().await?);
        }
        let Some(stream) = session.as_mut() else {
            return Err(TransportError::Closed);
        };

        let mut frame = Vec::new();
        request.encode(&mut frame);

        let result = Self::send_and_receive(stream, &frame).await;
        if result.is_err() {
            *session = None;
        }
        result
    }

    async fn send_and_receive(
        stream: &mut TcpStream,
        frame: &[u8],
    ) -> Result<Response, TransportError> {
        stream
            .write_all(frame)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut buf = Vec::with_capacity(4096);
        loop {
            match Response::parse(&buf) {
                Ok((response, _consumed)) => return Ok(response),
                Err(ParseError::Incomplete) => {}
                Err(ParseError::Invalid) => {
                    return Err(TransportError::Protocol("invalid response frame".to_string()));
                }
            }

            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            if n == 0 {
                return Err(TransportError::Io("connection closed by peer".to_string()));
            }
        }
    }

    /// Run `exchange` under an optional deadline. A timed-out request
    /// leaves the session mid-frame, so the session is reset.
    async fn request(
        &self,
        request: &Request,
        deadline: Option<Duration>,
    ) -> Result<Response, TransportError> {
        PEER_REQUESTS.increment();

        let result = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, self.exchange(request)).await {
                Ok(result) => result,
                Err(_) => {
                    PEER_TIMEOUTS.increment();
                    *self.session.lock().await = None;
                    Err(TransportError::Timeout)
                }
            },
            None => self.exchange(request).await,
        };

        if result.is_err() {
            PEER_ERRORS.increment();
        }
        result
    }
}

#[async_trait]
impl Peer for PeerClient {
    async fn get(&self, group: &str, key: &str) -> Result<Bytes, TransportError> {
        let request = Request::Get {
            group: group.to_string(),
            key: key.to_string(),
        };
        match self
            .request(&request, Some(self.options.request_timeout))
            .await?
        {
            Response::Value(value) => Ok(value),
            Response::Error(message) => Err(TransportError::Remote(message)),
            other => Err(TransportError::Protocol(format!(
                "unexpected response to get: {other:?}"
            ))),
        }
    }

    async fn set(&self, group: &str, key: &str, value: Bytes) -> Result<(), TransportError> {
        let request = Request::Set {
            group: group.to_string(),
            key: key.to_string(),
            value,
        };
        match self.request(&request, None).await? {
            Response::Stored => Ok(()),
            Response::Error(message) => Err(TransportError::Remote(message)),
            other => Err(TransportError::Protocol(format!(
                "unexpected response to set: {other:?}"
            ))),
        }
    }

    async fn delete(&self, group: &str, key: &str) -> Result<bool, TransportError> {
        let request = Request::Delete {
            group: group.to_string(),
            key: key.to_string(),
        };
        match self
            .request(&request, Some(self.options.request_timeout))
            .await?
        {
            Response::Deleted(deleted) => Ok(deleted),
            Response::Error(message) => Err(TransportError::Remote(message)),
            other => Err(TransportError::Protocol(format!(
                "unexpected response to delete: {other:?}"
            ))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut session = self.session.lock().await;
        if let Some(mut stream) = session.take() {
            let _ = stream.shutdown().await;
        }
        tracing::debug!(addr = %self.addr, "peer session closed");
        Ok(())
    }
}
