//! Stream-transport side of a fetch: dial the peer, send the HTTP/1.0
//! request, and pour the body into the slot's scratch file.  Every await
//! is wrapped in the idle timeout, so a peer that goes quiet mid-transfer
//! costs at most one timeout.  Failure here is not fatal to the fetch:
//! the caller switches the slot to the datagram transport, keeping
//! whatever bytes already landed.

use std::io::Write;
use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::fetch::SlotState;
use crate::http;
use crate::ids::PayloadHash;

/// Response heads larger than this are treated as a transport failure.
const HEADER_MAX: usize = 1024;

/// Body read granularity.
const READ_CHUNK: usize = 8192;

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncIo>;

/// Dialing seam for the stream transport; mocked with duplex pipes in
/// tests.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, addr: SocketAddrV4) -> anyhow::Result<BoxedStream>;
}

/// Plain TCP dialing for production hosts.
pub struct TcpConnector;

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self, addr: SocketAddrV4) -> anyhow::Result<BoxedStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

pub(crate) fn payload_request(hash: &PayloadHash) -> String {
    format!("GET /rhizome/file/{} HTTP/1.0\r\n\r\n", hash.to_hex())
}

pub(crate) fn manifest_request(prefix: &[u8]) -> String {
    format!(
        "GET /rhizome/manifestbyprefix/{} HTTP/1.0\r\n\r\n",
        hex::encode(prefix)
    )
}

/// How a stream attempt ended.  `written` counts bytes already in the
/// scratch file in every case.
#[derive(Debug)]
pub(crate) enum StreamOutcome {
    /// Full declared body received.
    Done { written: u64 },
    /// Peer-side failure: dial refused, early EOF, bad reply, timeout.
    /// The datagram transport should take over.
    Failed { written: u64 },
    /// Local failure writing the scratch file; the slot must close.
    Aborted { written: u64 },
}

pub(crate) async fn fetch_over_stream(
    connector: &dyn StreamConnector,
    addr: SocketAddrV4,
    request: &str,
    file: &mut std::fs::File,
    idle_timeout: Duration,
    mut on_state: impl FnMut(SlotState) + Send,
) -> StreamOutcome {
    let mut written: u64 = 0;

    on_state(SlotState::Connecting);
    let mut stream = match timeout(idle_timeout, connector.connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            tracing::debug!(%addr, error = %err, "stream dial failed");
            return StreamOutcome::Failed { written };
        }
        Err(_) => {
            tracing::debug!(%addr, "stream dial timed out");
            return StreamOutcome::Failed { written };
        }
    };

    on_state(SlotState::SendingRequest);
    match timeout(idle_timeout, stream.write_all(request.as_bytes())).await {
        Ok(Ok(())) => {}
        _ => {
            tracing::debug!(%addr, "failed sending request");
            return StreamOutcome::Failed { written };
        }
    }

    on_state(SlotState::RxHeaders);
    let mut head = Vec::with_capacity(HEADER_MAX);
    let (expected, first_body_bytes) = loop {
        let mut chunk = [0u8; HEADER_MAX];
        let n = match timeout(idle_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => {
                tracing::debug!(%addr, "connection lost reading response head");
                return StreamOutcome::Failed { written };
            }
        };
        head.extend_from_slice(&chunk[..n]);
        if http::header_end(&head).is_some() {
            match http::parse_response_head(&head) {
                Ok(reply) if reply.status != 200 => {
                    tracing::debug!(%addr, status = reply.status, reason = reply.reason,
                        "peer refused fetch");
                    return StreamOutcome::Failed { written };
                }
                Ok(reply) => match reply.content_length {
                    Some(length) => break (length, reply.body.to_vec()),
                    None => {
                        tracing::debug!(%addr, "reply missing Content-Length");
                        return StreamOutcome::Failed { written };
                    }
                },
                Err(err) => {
                    tracing::debug!(%addr, error = %err, "unparseable response head");
                    return StreamOutcome::Failed { written };
                }
            }
        }
        if head.len() >= HEADER_MAX {
            tracing::debug!(%addr, "oversized response head");
            return StreamOutcome::Failed { written };
        }
    };

    on_state(SlotState::RxStream);
    let take = (first_body_bytes.len() as u64).min(expected) as usize;
    if let Err(err) = file.write_all(&first_body_bytes[..take]) {
        tracing::warn!(error = %err, "scratch file write failed");
        return StreamOutcome::Aborted { written };
    }
    written += take as u64;

    let mut buf = [0u8; READ_CHUNK];
    while written < expected {
        let n = match timeout(idle_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => {
                tracing::debug!(%addr, written, expected, "stream ended before full body");
                return StreamOutcome::Failed { written };
            }
        };
        let take = (n as u64).min(expected - written) as usize;
        if let Err(err) = file.write_all(&buf[..take]) {
            tracing::warn!(error = %err, "scratch file write failed");
            return StreamOutcome::Aborted { written };
        }
        written += take as u64;
    }
    StreamOutcome::Done { written }
}
