//! TCP server answering peer traffic for local groups.

use crate::metrics::{SERVER_CONNECTIONS, SERVER_ERRORS, SERVER_REQUESTS};
use lattice::GroupRegistry;
use protocol_peer::{ParseError, Request, Response};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Serves Get/Set/Delete peer requests against the groups registered in
/// a [`GroupRegistry`].
pub struct PeerServer {
    listener: TcpListener,
    groups: GroupRegistry,
}

impl PeerServer {
    /// Bind the listener. The server does not accept until
    /// [`PeerServer::serve`] runs.
    pub async fn bind(addr: &str, groups: GroupRegistry) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, groups })
    }

    /// The bound address; useful with port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the task is dropped.
    pub async fn serve(self) -> std::io::Result<()> {
        tracing::info!(addr = ?self.listener.local_addr(), "peer server listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    SERVER_CONNECTIONS.increment();
                    let _ = stream.set_nodelay(true);
                    let groups = self.groups.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, groups).await
                            && !is_connection_reset(&e)
                        {
                            tracing::warn!(peer = %peer_addr, "peer connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, groups: GroupRegistry) -> std::io::Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);

    loop {
        // Serve every complete frame already buffered.
        loop {
            match Request::parse(&buf) {
                Ok((request, consumed)) => {
                    buf.drain(..consumed);
                    SERVER_REQUESTS.increment();

                    let response = dispatch(request, &groups).await;
                    if response.is_error() {
                        SERVER_ERRORS.increment();
                    }

                    let mut frame = Vec::new();
                    response.encode(&mut frame);
                    stream.write_all(&frame).await?;
                }
                Err(ParseError::Incomplete) => break,
                Err(ParseError::Invalid) => {
                    // Unrecoverable framing: answer once and drop the
                    // connection.
                    let mut frame = Vec::new();
                    Response::Error("invalid frame".to_string()).encode(&mut frame);
                    let _ = stream.write_all(&frame).await;
                    return Ok(());
                }
            }
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
    }
}

async fn dispatch(request: Request, groups: &GroupRegistry) -> Response {
    match request {
        Request::Get { group, key } => match groups.get(&group) {
            Some(group) => match group.get(&key).await {
                Ok(view) => Response::Value(view.into_bytes()),
                Err(e) => Response::Error(e.to_string()),
            },
            None => Response::Error(format!("no such group: {group}")),
        },
        Request::Set { group, key, value } => match groups.get(&group) {
            Some(group) => match group.set(&key, value).await {
                Ok(()) => Response::Stored,
                Err(e) => Response::Error(e.to_string()),
            },
            None => Response::Error(format!("no such group: {group}")),
        },
        Request::Delete { group, key } => match groups.get(&group) {
            Some(group) => match group.delete(&key).await {
                Ok(deleted) => Response::Deleted(deleted),
                Err(e) => Response::Error(e.to_string()),
            },
            None => Response::Error(format!("no such group: {group}")),
        },
    }
}

fn is_connection_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}
