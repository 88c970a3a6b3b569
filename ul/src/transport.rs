//! Transport layer: raw TCP (and optionally TLS) byte streams.
//!
//! This module owns the low-level socket plumbing:
//! opening outbound connections with a bound local address and a deadline,
//! binding listeners,
//! and moving whole PDUs between sockets and byte buffers.
//! It performs no PDU-level interpretation beyond framing
//! (reading the 6-byte header to learn how many bytes to expect).

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::pdu::reader::{check_pdu_length, read_pdu_body, NoPduAvailableSnafu, ReadFieldSnafu};
use crate::pdu::{Pdu, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE};

/// An error in the transport layer.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not resolve the target address
    Resolve {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// no address resolved for the target
    NoAddress { backtrace: Backtrace },

    /// could not bind the local socket
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not connect to the peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the connection attempt did not complete in time
    ConnectTimeout { backtrace: Backtrace },

    /// could not listen on the local address
    Listen {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Timeout parameters for the underlying socket.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SocketOptions {
    /// maximum time to wait for each read operation
    pub read_timeout: Option<Duration>,
    /// maximum time to wait for each write operation
    pub write_timeout: Option<Duration>,
    /// maximum time to wait for the TCP connection to open
    pub connection_timeout: Option<Duration>,
}

/// Open a TCP connection to `peer_addr`,
/// optionally binding the local end to `bind_addr`,
/// within the given deadline.
pub async fn connect(
    peer_addr: impl tokio::net::ToSocketAddrs,
    bind_addr: Option<SocketAddr>,
    connection_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let peer_addr = tokio::net::lookup_host(peer_addr)
        .await
        .context(ResolveSnafu)?
        .next()
        .ok_or_else(|| NoAddressSnafu.build())?;

    let socket = match peer_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .context(ConnectSnafu)?;

    if let Some(bind_addr) = bind_addr {
        socket.bind(bind_addr).context(BindSnafu)?;
    }

    let connecting = socket.connect(peer_addr);
    let stream = match connection_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ConnectTimeoutSnafu.build())?
            .context(ConnectSnafu)?,
        None => connecting.await.context(ConnectSnafu)?,
    };

    Ok(stream)
}

/// Bind a TCP listener on the given address
/// with the requested accept backlog.
pub async fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .context(ListenSnafu)?;
    socket.set_reuseaddr(true).context(ListenSnafu)?;
    socket.bind(addr).context(BindSnafu)?;
    socket.listen(backlog).context(ListenSnafu)
}

/// Read one full PDU from the socket into the reusable buffer,
/// then decode it.
///
/// The buffer retains bytes of a following PDU
/// that may already have arrived,
/// so the same buffer must be handed back on the next call.
pub async fn read_pdu_from_wire<S>(
    socket: &mut S,
    read_buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> std::result::Result<Pdu, crate::pdu::ReadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        // a full PDU header is enough to know the total length
        if read_buffer.len() >= PDU_HEADER_SIZE as usize {
            let pdu_type = read_buffer[0];
            let pdu_length = u32::from_be_bytes([
                read_buffer[2],
                read_buffer[3],
                read_buffer[4],
                read_buffer[5],
            ]);
            check_pdu_length(pdu_length, max_pdu_length, strict)?;

            let total = PDU_HEADER_SIZE as usize + pdu_length as usize;
            if read_buffer.len() >= total {
                let mut whole = read_buffer.split_to(total);
                whole.advance(PDU_HEADER_SIZE as usize);
                return read_pdu_body(pdu_type, &whole);
            }
            read_buffer.reserve(total - read_buffer.len());
        }

        let received = socket
            .read_buf(read_buffer)
            .await
            .context(ReadFieldSnafu { field: "PDU stream" })?;
        if received == 0 {
            // peer closed the connection:
            // an error mid-PDU, otherwise simply no PDU available
            if read_buffer.is_empty() {
                return NoPduAvailableSnafu.fail();
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a PDU",
            ))
            .context(ReadFieldSnafu { field: "PDU stream" });
        }
    }
}

/// Compute a sensible read buffer capacity
/// for an association with the given maximum PDU length.
pub(crate) fn read_buffer_capacity(max_pdu_length: u32) -> usize {
    (max_pdu_length.min(MAXIMUM_PDU_SIZE) + PDU_HEADER_SIZE) as usize
}

/// Run a future against an optional deadline,
/// passing through when no deadline is set.
pub(crate) async fn with_timeout<F, T, E>(
    deadline: Option<Duration>,
    make_timeout_error: impl FnOnce() -> E,
    task: F,
) -> std::result::Result<T, E>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, task).await {
            Ok(result) => result,
            Err(_) => Err(make_timeout_error()),
        },
        None => task.await,
    }
}

/// TLS support: wrapping established TCP streams
/// with a caller-provided `rustls` configuration.
#[cfg(feature = "tls")]
pub mod tls {
    use super::*;
    use std::sync::Arc;

    /// A client-side TLS stream over TCP.
    pub type ClientTlsStream = tokio_rustls::client::TlsStream<TcpStream>;
    /// A server-side TLS stream over TCP.
    pub type ServerTlsStream = tokio_rustls::server::TlsStream<TcpStream>;

    /// An error establishing the TLS layer.
    #[derive(Debug, Snafu)]
    #[non_exhaustive]
    pub enum TlsError {
        /// invalid server name for certificate verification
        ServerName {
            source: rustls::pki_types::InvalidDnsNameError,
            backtrace: Backtrace,
        },
        /// TLS handshake failed
        Handshake {
            source: std::io::Error,
            backtrace: Backtrace,
        },
    }

    /// Wrap an outbound TCP stream in TLS,
    /// verifying the server against `domain`.
    pub async fn wrap_client(
        stream: TcpStream,
        config: Arc<rustls::ClientConfig>,
        domain: &str,
    ) -> Result<ClientTlsStream, TlsError> {
        let connector = tokio_rustls::TlsConnector::from(config);
        let server_name = rustls::pki_types::ServerName::try_from(domain.to_string())
            .context(ServerNameSnafu)?;
        connector
            .connect(server_name, stream)
            .await
            .context(HandshakeSnafu)
    }

    /// Wrap an accepted TCP stream in TLS.
    pub async fn wrap_server(
        stream: TcpStream,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<ServerTlsStream, TlsError> {
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        acceptor.accept(stream).await.context(HandshakeSnafu)
    }
}

/// Write the given bytes fully to the socket.
///
/// Writes are all-or-error:
/// partial progress followed by a failure surfaces the failure.
pub async fn write_all<S>(socket: &mut S, bytes: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(bytes).await
}
