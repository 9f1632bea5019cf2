//! A paired device's packet stream: a TLS-wrapped TCP connection plus the
//! out-of-band payload subchannels opened alongside it.
//!
//! Framing is line-delimited JSON: each packet is one `\n`-terminated line.
//! Reads are bounded both by [`DEFAULT_MAX_PACKET_SIZE`] (a malicious or
//! broken peer cannot force unbounded buffering) and by a per-read timeout,
//! so a half-open socket doesn't wedge the device's connection task.

use crate::crypto::tls::{client_config_for, server_config_for};
use crate::crypto::IdentityStore;
use crate::error::{ProtocolError, Result};
use crate::protocol::packet::{Packet, DEFAULT_MAX_PACKET_SIZE, PORT_RANGE_END, PORT_RANGE_START};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// Bound on how long a single packet read may take before the channel is
/// considered dead.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on how long a TLS handshake (main channel or payload subchannel)
/// may take before it is treated as failed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on how long an upload listener waits for the peer to connect
/// before giving up.
pub const PAYLOAD_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live packet stream to a peer device.
pub struct Channel {
    stream: BufReader<TlsStream<TcpStream>>,
    peer_addr: SocketAddr,
    peer_cert_der: Vec<u8>,
    max_packet_size: usize,
}

impl Channel {
    /// Wrap a TCP connection this device *accepted* in TLS, as the TLS
    /// server. Per the "receiver initiates TLS" rule, the side that
    /// accepted the TCP connection becomes the TLS server.
    pub async fn from_accepted(tcp: TcpStream, identity: &IdentityStore) -> Result<Self> {
        let peer_addr = tcp.peer_addr()?;
        let acceptor = TlsAcceptor::from(server_config_for(identity)?);
        let tls = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
            .await
            .map_err(|_| ProtocolError::Timeout("TLS accept".into()))?
            .map_err(|e| ProtocolError::auth_failed(format!("TLS accept failed: {e}")))?;
        let peer_cert_der = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|c| c.first())
            .map(|c| c.as_ref().to_vec())
            .ok_or_else(|| ProtocolError::auth_failed("peer presented no certificate"))?;
        Ok(Self {
            stream: BufReader::new(TlsStream::Server(tls)),
            peer_addr,
            peer_cert_der,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
    }

    /// Wrap a TCP connection this device *initiated* in TLS, as the TLS
    /// client.
    pub async fn from_connected(
        tcp: TcpStream,
        peer_ip: std::net::IpAddr,
        identity: &IdentityStore,
    ) -> Result<Self> {
        let peer_addr = tcp.peer_addr()?;
        let connector = TlsConnector::from(client_config_for(identity)?);
        let server_name = rustls_pki_types::ServerName::IpAddress(peer_ip.into());
        let tls = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProtocolError::Timeout("TLS connect".into()))?
            .map_err(|e| ProtocolError::auth_failed(format!("TLS connect failed: {e}")))?;
        let peer_cert_der = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|c| c.first())
            .map(|c| c.as_ref().to_vec())
            .ok_or_else(|| ProtocolError::auth_failed("peer presented no certificate"))?;
        Ok(Self {
            stream: BufReader::new(TlsStream::Client(tls)),
            peer_addr,
            peer_cert_der,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_cert_der(&self) -> &[u8] {
        &self.peer_cert_der
    }

    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }

    /// Read one packet, blocking up to [`READ_TIMEOUT`].
    pub async fn read_packet(&mut self) -> Result<Packet> {
        timeout(READ_TIMEOUT, self.read_packet_inner())
            .await
            .map_err(|_| ProtocolError::Timeout("reading packet".into()))?
    }

    async fn read_packet_inner(&mut self) -> Result<Packet> {
        let mut line = Vec::new();
        // `take` bounds the BufReader so a peer that never sends the
        // delimiter can't grow `line` past max_packet_size before we notice.
        let limit = self.max_packet_size as u64 + 1;
        let n = (&mut self.stream).take(limit).read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(ProtocolError::Closed);
        }
        if line.last() != Some(&b'\n') {
            if line.len() as u64 >= limit {
                return Err(ProtocolError::invalid_data("packet exceeds maximum size"));
            }
            return Err(ProtocolError::Closed);
        }
        line.pop();
        Packet::from_bytes(&line)
    }

    /// Write one packet, framed with the trailing `\n`.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        if bytes.len() > self.max_packet_size {
            return Err(ProtocolError::invalid_data("packet exceeds maximum size"));
        }
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Open an outbound payload subchannel by listening on the first free
    /// port in the LAN payload range, for the peer to connect to.
    pub async fn open_upload_subchannel() -> Result<(TcpListener, u16)> {
        for port in PORT_RANGE_START..=PORT_RANGE_END {
            let addr: SocketAddr = ([0, 0, 0, 0], port).into();
            if let Ok(listener) = TcpListener::bind(addr).await {
                return Ok((listener, port));
            }
        }
        Err(ProtocolError::invalid_data(
            "no free port in the payload range",
        ))
    }

    /// Accept a single payload connection on a listener returned by
    /// [`Channel::open_upload_subchannel`] and wrap it in TLS as the server.
    /// The connecting peer's certificate must match `main_channel_peer_cert`
    /// (the cert presented on the owning device's main channel); a listener
    /// that sees no connection within [`PAYLOAD_ACCEPT_TIMEOUT`] fails with
    /// [`ProtocolError::Timeout`].
    pub async fn accept_upload(
        listener: TcpListener,
        identity: &IdentityStore,
        main_channel_peer_cert: &[u8],
    ) -> Result<tokio_rustls::server::TlsStream<TcpStream>> {
        let (tcp, _addr) = timeout(PAYLOAD_ACCEPT_TIMEOUT, listener.accept())
            .await
            .map_err(|_| ProtocolError::Timeout("waiting for payload connection".into()))??;
        let acceptor = TlsAcceptor::from(server_config_for(identity)?);
        let tls = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
            .await
            .map_err(|_| ProtocolError::Timeout("payload TLS accept".into()))?
            .map_err(|e| ProtocolError::auth_failed(format!("payload TLS accept failed: {e}")))?;
        let presented = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|c| c.first())
            .map(|c| c.as_ref().to_vec())
            .ok_or_else(|| ProtocolError::auth_failed("payload peer presented no certificate"))?;
        if presented != main_channel_peer_cert {
            return Err(ProtocolError::auth_failed(
                "payload subchannel peer certificate does not match the main channel",
            ));
        }
        Ok(tls)
    }

    /// Connect to a peer-advertised payload port and wrap the connection
    /// in TLS as the client. The peer's certificate on this subchannel
    /// must match `main_channel_peer_cert`.
    pub async fn connect_download(
        peer_ip: std::net::IpAddr,
        port: u16,
        identity: &IdentityStore,
        main_channel_peer_cert: &[u8],
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        if !(PORT_RANGE_START..=PORT_RANGE_END).contains(&port) {
            return Err(ProtocolError::invalid_data(format!(
                "payload port {port} out of range"
            )));
        }
        let tcp = TcpStream::connect((peer_ip, port)).await?;
        let connector = TlsConnector::from(client_config_for(identity)?);
        let server_name = rustls_pki_types::ServerName::IpAddress(peer_ip.into());
        let tls = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProtocolError::Timeout("payload TLS connect".into()))?
            .map_err(|e| ProtocolError::auth_failed(format!("payload TLS connect failed: {e}")))?;
        let presented = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|c| c.first())
            .map(|c| c.as_ref().to_vec())
            .ok_or_else(|| ProtocolError::auth_failed("payload peer presented no certificate"))?;
        if presented != main_channel_peer_cert {
            return Err(ProtocolError::auth_failed(
                "payload subchannel peer certificate does not match the main channel",
            ));
        }
        Ok(tls)
    }
}
