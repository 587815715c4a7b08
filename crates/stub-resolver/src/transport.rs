//! How queries reach a nameserver.
//!
//! The resolver core only knows the `Transport` trait; `NetTransport`
//! is the bundled implementation speaking plain UDP, TCP with the
//! two-octet length prefix, and DNS-over-HTTPS POST.  Tests inject
//! scripted transports instead.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_model::message::Message;
use dns_model::wire::{from_wire, to_wire};

/// An error from one attempt against one nameserver.
///
/// These never escape a `resolve` call directly: the resolution state
/// machine absorbs them into its attempt log and decides whether the
/// nameserver stays in the pool.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Socket-level failure.
    Io(String),
    /// The per-attempt timeout elapsed.
    Timeout,
    /// The response was truncated.  Over UDP this mandates a TCP
    /// retry; over TCP the server is broken.
    Truncated,
    /// The request could not be serialised, the response could not be
    /// parsed, or the response does not belong to the request.
    Form(String),
    /// A TCP stream ended before the advertised message length.
    ShortRead { expected: usize, actual: usize },
    /// The server cannot answer this kind of query.
    NotImplemented,
    /// A DNS-over-HTTPS exchange failed at the HTTP layer.
    Http(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Io(error) => write!(f, "I/O error: {error}"),
            TransportError::Timeout => write!(f, "timed out"),
            TransportError::Truncated => write!(f, "message truncated"),
            TransportError::Form(error) => write!(f, "malformed message: {error}"),
            TransportError::ShortRead { expected, actual } => {
                write!(f, "short read: expected {expected} octets, got {actual}")
            }
            TransportError::NotImplemented => write!(f, "not implemented"),
            TransportError::Http(error) => write!(f, "HTTP error: {error}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A way of exchanging one request for one response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn udp(
        &self,
        request: &Message,
        nameserver: IpAddr,
        port: u16,
        source: Option<IpAddr>,
        source_port: u16,
        timeout: Duration,
    ) -> Result<Message, TransportError>;

    async fn tcp(
        &self,
        request: &Message,
        nameserver: IpAddr,
        port: u16,
        source: Option<IpAddr>,
        source_port: u16,
        timeout: Duration,
    ) -> Result<Message, TransportError>;

    async fn https(
        &self,
        request: &Message,
        url: &str,
        timeout: Duration,
    ) -> Result<Message, TransportError>;
}

/// The bundled network transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetTransport;

impl NetTransport {
    pub fn new() -> Self {
        NetTransport
    }
}

fn io_error(error: std::io::Error) -> TransportError {
    TransportError::Io(error.to_string())
}

fn form_error(error: dns_model::wire::WireError) -> TransportError {
    TransportError::Form(error.to_string())
}

fn bind_address(source: Option<IpAddr>, source_port: u16, nameserver: IpAddr) -> SocketAddr {
    match source {
        Some(addr) => SocketAddr::new(addr, source_port),
        None => match nameserver {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), source_port),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), source_port),
        },
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn udp(
        &self,
        request: &Message,
        nameserver: IpAddr,
        port: u16,
        source: Option<IpAddr>,
        source_port: u16,
        attempt_timeout: Duration,
    ) -> Result<Message, TransportError> {
        let octets = to_wire(request).map_err(form_error)?;

        let response = match timeout(attempt_timeout, async {
            let sock = UdpSocket::bind(bind_address(source, source_port, nameserver))
                .await
                .map_err(io_error)?;
            sock.connect(SocketAddr::new(nameserver, port))
                .await
                .map_err(io_error)?;
            sock.send(&octets).await.map_err(io_error)?;

            let mut buf = vec![0u8; 65535];
            loop {
                let received = sock.recv(&mut buf).await.map_err(io_error)?;
                let response = from_wire(&buf[..received]).map_err(form_error)?;

                // a datagram with the wrong ID is not ours: someone
                // else's late answer, or junk.  Keep waiting.
                if response.header.id == request.header.id && response.header.is_response {
                    return Ok(response);
                }
                tracing::trace!(id = %response.header.id, "ignoring mismatched datagram");
            }
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout),
        };

        if response.header.is_truncated {
            return Err(TransportError::Truncated);
        }

        Ok(response)
    }

    async fn tcp(
        &self,
        request: &Message,
        nameserver: IpAddr,
        port: u16,
        source: Option<IpAddr>,
        source_port: u16,
        attempt_timeout: Duration,
    ) -> Result<Message, TransportError> {
        let octets = to_wire(request).map_err(form_error)?;
        let length = u16::try_from(octets.len())
            .map_err(|_| TransportError::Form("message over 65535 octets".to_string()))?;

        let response = match timeout(attempt_timeout, async {
            let socket = match nameserver {
                IpAddr::V4(_) => TcpSocket::new_v4(),
                IpAddr::V6(_) => TcpSocket::new_v6(),
            }
            .map_err(io_error)?;
            if source.is_some() || source_port != 0 {
                socket
                    .bind(bind_address(source, source_port, nameserver))
                    .map_err(io_error)?;
            }
            let mut stream = socket
                .connect(SocketAddr::new(nameserver, port))
                .await
                .map_err(io_error)?;

            stream
                .write_all(&length.to_be_bytes())
                .await
                .map_err(io_error)?;
            stream.write_all(&octets).await.map_err(io_error)?;

            read_tcp_response(&mut stream).await
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout),
        };

        if response.header.is_truncated {
            return Err(TransportError::Truncated);
        }

        Ok(response)
    }

    async fn https(
        &self,
        request: &Message,
        url: &str,
        attempt_timeout: Duration,
    ) -> Result<Message, TransportError> {
        let octets = to_wire(request).map_err(form_error)?;

        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .map_err(|error| TransportError::Http(error.to_string()))?;

        let http_response = client
            .post(url)
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(octets)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Http(error.to_string())
                }
            })?;

        if !http_response.status().is_success() {
            return Err(TransportError::Http(format!(
                "unexpected status {}",
                http_response.status()
            )));
        }

        let body = http_response
            .bytes()
            .await
            .map_err(|error| TransportError::Http(error.to_string()))?;
        let response = from_wire(&body).map_err(form_error)?;

        if response.header.id != request.header.id || !response.header.is_response {
            return Err(TransportError::Form(
                "response does not match request".to_string(),
            ));
        }
        if response.header.is_truncated {
            return Err(TransportError::Truncated);
        }

        Ok(response)
    }
}

/// Read one length-prefixed message from a TCP stream.
///
/// The big-endian u16 prefix is redundant (the header says how many
/// fields follow) but it means the whole message can be read before
/// parsing begins.
async fn read_tcp_response(stream: &mut TcpStream) -> Result<Message, TransportError> {
    let expected = match stream.read_u16().await {
        Ok(size) => usize::from(size),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ShortRead {
                expected: 2,
                actual: 0,
            })
        }
        Err(error) => return Err(io_error(error)),
    };

    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        match stream.read_buf(&mut bytes).await {
            Ok(0) => {
                return Err(TransportError::ShortRead {
                    expected,
                    actual: bytes.len(),
                })
            }
            Ok(_) => (),
            Err(error) => return Err(io_error(error)),
        }
    }

    from_wire(&bytes).map_err(form_error)
}
