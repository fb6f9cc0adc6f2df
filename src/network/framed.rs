//! The default wire-protocol provider: a minimal length-prefixed envelope
//! over TCP.
//!
//! Every frame is `opcode (u8) | body length (u32, big endian) | body`. The
//! body of a command frame embeds the routing fields and the caller's payload
//! verbatim; the payload's meaning stays the server's and mapper's business.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::client::ConnectionManager;
use crate::command::{Command, CommandBatch, CommandResponse, Consistency};
use crate::errors::{
    ClusterUnavailableError, ConnectivityError, ExecutionError, ScanError,
};
use crate::network::{Connection, ConnectionConfig};
use crate::provider::{ClusterDetector, ConnectionProvider, Transport};

mod opcode {
    pub(super) const SELECT: u8 = 0x01;
    pub(super) const PING: u8 = 0x02;
    pub(super) const COMMAND: u8 = 0x03;
    pub(super) const BATCH: u8 = 0x04;
    pub(super) const PEERS: u8 = 0x05;
    pub(super) const OK: u8 = 0x80;
    pub(super) const ERROR: u8 = 0x81;
}

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

enum Reply {
    Ok(Bytes),
    Error(String),
}

/// [`ConnectionProvider`] speaking the framed envelope protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedProvider;

impl FramedProvider {
    /// Creates the provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionProvider for FramedProvider {
    fn new_connection(
        &self,
        id: u64,
        addr: SocketAddr,
        keyspace: &str,
        config: &ConnectionConfig,
    ) -> Connection {
        Connection::new(id, addr, keyspace, Box::new(FramedTransport::new(config.clone())))
    }

    async fn execute(
        &self,
        command: &Command,
        connection: &mut Connection,
        consistency: Consistency,
    ) -> Result<CommandResponse, ExecutionError> {
        let addr = connection.addr();
        let body = encode_command(command, consistency);
        let transport = framed_transport(connection)?;
        match transport.roundtrip(opcode::COMMAND, &body).await {
            Ok(Reply::Ok(payload)) => Ok(CommandResponse { payload }),
            Ok(Reply::Error(reason)) => Err(ExecutionError::Protocol { addr, reason }),
            Err(source) => Err(ExecutionError::Network { addr, source }),
        }
    }

    async fn execute_batch(
        &self,
        batch: &CommandBatch,
        connection: &mut Connection,
        consistency: Consistency,
    ) -> Result<(), ExecutionError> {
        let addr = connection.addr();
        let body = encode_batch(batch, consistency);
        let transport = framed_transport(connection)?;
        match transport.roundtrip(opcode::BATCH, &body).await {
            Ok(Reply::Ok(_)) => Ok(()),
            Ok(Reply::Error(reason)) => Err(ExecutionError::Protocol { addr, reason }),
            Err(source) => Err(ExecutionError::Network { addr, source }),
        }
    }

    fn new_cluster_detector(&self) -> Box<dyn ClusterDetector> {
        Box::new(FramedClusterDetector)
    }
}

fn framed_transport(connection: &mut Connection) -> Result<&mut FramedTransport, ExecutionError> {
    let addr = connection.addr();
    connection
        .transport_mut()
        .as_any_mut()
        .downcast_mut::<FramedTransport>()
        .ok_or_else(|| ExecutionError::Unknown {
            addr,
            reason: "connection does not carry a framed transport".to_owned(),
        })
}

fn encode_command(command: &Command, consistency: Consistency) -> BytesMut {
    let mut buf =
        BytesMut::with_capacity(7 + command.table.len() + command.key.len() + command.payload.len());
    buf.put_u8(consistency as u8);
    buf.put_u16(command.table.len() as u16);
    buf.put_slice(command.table.as_bytes());
    buf.put_u32(command.key.len() as u32);
    buf.put_slice(&command.key);
    buf.put_slice(&command.payload);
    buf
}

fn encode_batch(batch: &CommandBatch, consistency: Consistency) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(consistency as u8);
    buf.put_u32(batch.len() as u32);
    for command in batch.iter() {
        buf.put_u16(command.table.len() as u16);
        buf.put_slice(command.table.as_bytes());
        buf.put_u32(command.key.len() as u32);
        buf.put_slice(&command.key);
        buf.put_u32(command.payload.len() as u32);
        buf.put_slice(&command.payload);
    }
    buf
}

/// [`Transport`] implementation over a plain TCP stream.
pub struct FramedTransport {
    config: ConnectionConfig,
    stream: Option<TcpStream>,
}

impl FramedTransport {
    /// Creates a not-yet-connected transport.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport not established"))
    }

    async fn roundtrip(&mut self, request_opcode: u8, body: &[u8]) -> io::Result<Reply> {
        let stream = self.stream()?;

        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.put_u8(request_opcode);
        frame.put_u32(body.len() as u32);
        frame.put_slice(body);
        stream.write_all(&frame).await?;

        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;
        let reply_opcode = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply frame of {len} bytes exceeds the frame limit"),
            ));
        }
        let mut reply_body = vec![0u8; len];
        stream.read_exact(&mut reply_body).await?;

        match reply_opcode {
            opcode::OK => Ok(Reply::Ok(Bytes::from(reply_body))),
            opcode::ERROR => Ok(Reply::Error(
                String::from_utf8_lossy(&reply_body).into_owned(),
            )),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected reply opcode {other:#04x}"),
            )),
        }
    }
}

#[async_trait]
impl Transport for FramedTransport {
    async fn handshake(&mut self, addr: SocketAddr, keyspace: &str) -> Result<(), ConnectivityError> {
        let transport_err =
            |source: io::Error| ConnectivityError::Transport { addr, source };

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectivityError::ConnectTimeout { addr })?
            .map_err(transport_err)?;
        stream.set_nodelay(self.config.tcp_nodelay).map_err(transport_err)?;
        if let Some(interval) = self.config.tcp_keepalive_interval {
            setup_tcp_keepalive(&stream, interval).map_err(transport_err)?;
        }
        self.stream = Some(stream);
        trace!(%addr, "transport established, selecting keyspace");

        match self
            .roundtrip(opcode::SELECT, keyspace.as_bytes())
            .await
            .map_err(transport_err)?
        {
            Reply::Ok(_) => Ok(()),
            Reply::Error(reason) => {
                // The host answered, so the link itself is fine; do not reuse
                // it for a connection whose keyspace was refused.
                self.stream = None;
                Err(ConnectivityError::Handshake {
                    addr,
                    keyspace: keyspace.to_owned(),
                    reason,
                })
            }
        }
    }

    async fn probe(&mut self) -> Result<(), io::Error> {
        match self.roundtrip(opcode::PING, &[]).await? {
            Reply::Ok(_) => Ok(()),
            Reply::Error(reason) => Err(io::Error::other(reason)),
        }
    }

    async fn shutdown(&mut self) -> Result<(), io::Error> {
        match self.stream.take() {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn setup_tcp_keepalive(stream: &TcpStream, interval: Duration) -> io::Result<()> {
    // "time" here is idle time until keepalives start; the probe interval
    // itself is fixed at one second on platforms that let us set it.
    let mut tcp_keepalive = TcpKeepalive::new().with_time(interval);

    #[cfg(any(
        target_os = "android",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "illumos",
        target_os = "ios",
        target_os = "linux",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "windows",
    ))]
    {
        tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
    }

    let sf = SockRef::from(stream);
    sf.set_tcp_keepalive(&tcp_keepalive)
}

/// Topology detector for the framed protocol.
///
/// Asks the first reachable known host for its peer list and feeds newly
/// discovered peers into the registry. Reachability learned along the way is
/// reported too: the probed host is promoted on a successful handshake and
/// demoted on a failed one.
struct FramedClusterDetector;

#[async_trait]
impl ClusterDetector for FramedClusterDetector {
    async fn scan(&self, manager: &ConnectionManager) -> Result<(), ScanError> {
        let registry = manager.registry();
        let candidates = registry.hosts();
        if candidates.is_empty() {
            return Err(ClusterUnavailableError::NoKnownHosts.into());
        }

        let mut last_failure: Option<ConnectivityError> = None;
        for addr in candidates {
            let mut transport = FramedTransport::new(manager.connection_config().clone());
            match transport.handshake(addr, manager.keyspace()).await {
                Ok(()) => {
                    let outcome = transport.roundtrip(opcode::PEERS, &[]).await;
                    let _ = transport.shutdown().await;
                    let peers = match outcome {
                        Ok(Reply::Ok(body)) => parse_peers(&body),
                        Ok(Reply::Error(reason)) => return Err(ScanError::Detector(reason)),
                        Err(source) => {
                            return Err(ExecutionError::Network { addr, source }.into());
                        }
                    };

                    registry.node_available(addr);
                    let known = registry.hosts();
                    let mut admitted = 0usize;
                    for peer in peers {
                        if !known.contains(&peer) {
                            registry.node_available(peer);
                            admitted += 1;
                        }
                    }
                    debug!(scanned = %addr, admitted, "topology scan complete");
                    return Ok(());
                }
                Err(err) => {
                    debug!(%addr, error = %err, "topology probe failed, demoting host");
                    registry.node_unavailable(addr);
                    last_failure = Some(err);
                }
            }
        }

        Err(last_failure
            .map(ScanError::Connectivity)
            .unwrap_or_else(|| ClusterUnavailableError::NoKnownHosts.into()))
    }
}

/// Parses a peer list reply: one `ip:port` address per line.
fn parse_peers(body: &[u8]) -> Vec<SocketAddr> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match line.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!(peer = line, "ignoring unparseable peer address");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    /// A scripted single-keyspace server: accepts any number of connections,
    /// SELECT succeeds only for "ks", PING replies OK, COMMAND echoes its
    /// body, BATCH replies OK, PEERS replies with a fixed list.
    async fn spawn_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    loop {
                        let mut header = [0u8; 5];
                        if socket.read_exact(&mut header).await.is_err() {
                            return;
                        }
                        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]])
                            as usize;
                        let mut body = vec![0u8; len];
                        if socket.read_exact(&mut body).await.is_err() {
                            return;
                        }
                        let (status, reply): (u8, Vec<u8>) = match header[0] {
                            opcode::SELECT if body == b"ks" => (opcode::OK, Vec::new()),
                            opcode::SELECT => {
                                (opcode::ERROR, b"unknown keyspace".to_vec())
                            }
                            opcode::PING | opcode::BATCH => (opcode::OK, Vec::new()),
                            opcode::COMMAND => (opcode::OK, body),
                            opcode::PEERS => {
                                (opcode::OK, b"10.0.0.7:9160\n10.0.0.8:9160\n".to_vec())
                            }
                            _ => (opcode::ERROR, b"bad opcode".to_vec()),
                        };
                        let mut frame = BytesMut::with_capacity(5 + reply.len());
                        frame.put_u8(status);
                        frame.put_u32(reply.len() as u32);
                        frame.put_slice(&reply);
                        if socket.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::default()
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn handshake_selects_keyspace_and_probe_succeeds() {
        setup_tracing();
        let addr = spawn_server().await;
        let mut transport = FramedTransport::new(config());
        transport.handshake(addr, "ks").await.unwrap();
        transport.probe().await.unwrap();
        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn rejected_keyspace_is_a_handshake_error() {
        setup_tracing();
        let addr = spawn_server().await;
        let mut transport = FramedTransport::new(config());
        assert_matches!(
            transport.handshake(addr, "nope").await,
            Err(ConnectivityError::Handshake { keyspace, .. }) if keyspace == "nope"
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn unreachable_host_is_a_transport_error() {
        setup_tracing();
        // Bind then drop to get an address nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = FramedTransport::new(config());
        assert_matches!(
            transport.handshake(addr, "ks").await,
            Err(ConnectivityError::Transport { .. })
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn execute_roundtrips_through_a_connection() {
        setup_tracing();
        let addr = spawn_server().await;
        let provider = FramedProvider::new();
        let mut connection = provider.new_connection(0, addr, "ks", &config());
        connection.open().await.unwrap();

        let command = Command::new("events", &b"row-1"[..], &b"payload"[..]);
        let response = provider
            .execute(&command, &mut connection, Consistency::Quorum)
            .await
            .unwrap();
        // The test server echoes the encoded command body back.
        assert_eq!(
            &response.payload[..],
            &encode_command(&command, Consistency::Quorum)[..]
        );

        let batch: CommandBatch = vec![command.clone(), command].into();
        provider
            .execute_batch(&batch, &mut connection, Consistency::One)
            .await
            .unwrap();

        connection.close().await;
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn severed_stream_is_a_network_error() {
        setup_tracing();
        let addr = spawn_server().await;
        let provider = FramedProvider::new();
        let mut connection = provider.new_connection(0, addr, "ks", &config());
        connection.open().await.unwrap();

        // Sever the transport under the connection.
        framed_transport(&mut connection)
            .unwrap()
            .shutdown()
            .await
            .unwrap();

        let command = Command::new("events", &b"k"[..], &b"p"[..]);
        assert_matches!(
            provider
                .execute(&command, &mut connection, Consistency::One)
                .await,
            Err(ExecutionError::Network { .. })
        );
    }

    #[test]
    fn peer_lines_parse_and_garbage_is_skipped() {
        let peers = parse_peers(b"10.0.0.7:9160\nnot-an-addr\n\n10.0.0.8:9161\n");
        assert_eq!(
            peers,
            vec![
                "10.0.0.7:9160".parse::<SocketAddr>().unwrap(),
                "10.0.0.8:9161".parse().unwrap()
            ]
        );
    }
}
