//! # Framed TCP peer RPC
//!
//! One request/response exchange per connection:
//!
//! ```text
//! client                                server
//!   | -- u32 BE len | bincode(RequestFrame) -->  |
//!   | <-- u32 BE len | bincode(PeerResponse) --  |
//!   close                                  close
//! ```
//!
//! The client holds no connection state between calls. Dropping a pending
//! [`TcpRpc::call`] future drops its `TcpStream`, which closes the socket, so
//! a cancelled call never leaves a connection behind.
//!
//! The server rejects frames that are oversized, that claim a `from` uid
//! different from the frame sender, or that claim to come from this node
//! (self-pings are driven in-process, never over the network).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::messages::{
    deserialize_bounded, output, serialize_frame, PeerResponse, RequestEnvelope, RequestFrame,
    MAX_FRAME_SIZE,
};
use crate::protocols::{EnvelopeHandler, PeerRpc};
use crate::registry::{Peer, Uid};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).context("frame length overflows u32")?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Oversized frames fail with `InvalidData`
/// before any body is read.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        )
        .into());
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

fn invalid_data(e: bincode::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

/// Client side of the peer RPC.
#[derive(Clone, Debug)]
pub struct TcpRpc {
    sender: Uid,
}

impl TcpRpc {
    pub fn new(sender: Uid) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl PeerRpc for TcpRpc {
    async fn call(&self, peer: &Peer, envelope: &RequestEnvelope) -> Result<PeerResponse> {
        let frame = RequestFrame { sender: self.sender, envelope: envelope.clone() };
        let request_bytes = serialize_frame(&frame).context("failed to serialize request")?;

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer.addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?
            .with_context(|| format!("failed to connect to {}", peer.addr))?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, &request_bytes).await?;
        let response_bytes = read_frame(&mut stream).await.map_err(|e| {
            trace!(uid = peer.uid, addr = %peer.addr, error = %e, "response read failed");
            e
        })?;
        let response: PeerResponse = deserialize_bounded(&response_bytes)
            .map_err(invalid_data)
            .context("failed to deserialize response")?;
        Ok(response)
    }
}

/// Inbound listener answering envelopes through an [`EnvelopeHandler`].
pub struct RpcServer {
    listener: TcpListener,
    self_uid: Uid,
    process_timeout: Duration,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr, self_uid: Uid) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self { listener, self_uid, process_timeout: DEFAULT_PROCESS_TIMEOUT })
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` flips to `true`.
    pub async fn serve(self, handler: Arc<dyn EnvelopeHandler>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local = self.local_addr()?;
        info!(addr = %local, uid = self.self_uid, "rpc server listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let handler = handler.clone();
                    let self_uid = self.self_uid;
                    let process_timeout = self.process_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_stream(stream, remote, self_uid, handler, process_timeout).await {
                            debug!(remote = %remote, error = ?e, "stream error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(addr = %local, "rpc server stopped");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn rejection(self_uid: Uid, error: &str) -> PeerResponse {
    let mut out = output("error", false, self_uid);
    out.insert("error".into(), error.into());
    PeerResponse::rejected(out)
}

async fn handle_stream(
    mut stream: TcpStream,
    remote: SocketAddr,
    self_uid: Uid,
    handler: Arc<dyn EnvelopeHandler>,
    process_timeout: Duration,
) -> Result<()> {
    let read = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| anyhow::anyhow!("request read timed out"))?;

    let response = match read {
        Ok(bytes) => match deserialize_bounded::<RequestFrame>(&bytes) {
            Ok(frame) => answer(frame, remote, self_uid, handler.as_ref(), process_timeout).await,
            Err(e) => {
                debug!(remote = %remote, error = %e, "undecodable request");
                rejection(self_uid, "malformed request")
            }
        },
        Err(e) => {
            warn!(remote = %remote, error = %e, "rejecting request");
            rejection(self_uid, "unreadable request")
        }
    };

    let bytes = serialize_frame(&response).context("failed to serialize response")?;
    write_frame(&mut stream, &bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn answer(
    frame: RequestFrame,
    remote: SocketAddr,
    self_uid: Uid,
    handler: &dyn EnvelopeHandler,
    process_timeout: Duration,
) -> PeerResponse {
    if frame.sender == self_uid {
        warn!(remote = %remote, "rejecting request claiming our own uid");
        return rejection(self_uid, "sender uid is the receiving node");
    }
    if let Some(claimed) = frame.envelope.from_uid()
        && claimed != frame.sender
    {
        warn!(remote = %remote, claimed, sender = frame.sender, "rejecting request: sender mismatch");
        return rejection(self_uid, "from field does not match sender");
    }

    trace!(remote = %remote, sender = frame.sender, kind = frame.envelope.request.type_tag(), "inbound request");
    match tokio::time::timeout(process_timeout, handler.handle(frame.sender, frame.envelope)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(remote = %remote, "request processing timed out");
            rejection(self_uid, "request processing timeout")
        }
    }
}
