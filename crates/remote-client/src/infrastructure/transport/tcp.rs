//! Plain TCP transport.
//!
//! One `run()` is one TCP connection: connect with a timeout, disable Nagle
//! (speech and key records are tiny and latency-sensitive), spawn the drain
//! task on the write half, then read until EOF, a read error or the kill
//! switch.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use super::{Outbound, Transport, TransportCore, TransportError, TransportOptions, WRITE_TIMEOUT};

/// Bytes requested per socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Configuration for a [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// `host:port` of the remote end.  Resolved on every attempt.
    pub address: String,
    pub connect_timeout: Duration,
    pub options: TransportOptions,
}

impl TcpTransportConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(10),
            options: TransportOptions::default(),
        }
    }
}

/// A reconnecting TCP transport with no handshake of its own.
pub struct TcpTransport {
    config: TcpTransportConfig,
    core: TransportCore,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        let core = TransportCore::new(&config.options);
        Self { config, core }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn run(&self) -> Result<(), TransportError> {
        let core = &self.core;
        let mut kill = core.arm_kill_switch()?;
        let addr = self.config.address.as_str();
        let timeout = self.config.connect_timeout;

        let stream = tokio::select! {
            _ = &mut kill.signal => return Err(TransportError::Closing),
            attempt = time::timeout(timeout, TcpStream::connect(addr)) => match attempt {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    let error = TransportError::ConnectFailed { addr: addr.to_string(), source };
                    core.connection_failed(&error);
                    return Err(error);
                }
                Err(_) => {
                    let error = TransportError::ConnectTimeout { addr: addr.to_string(), timeout };
                    core.connection_failed(&error);
                    return Err(error);
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable Nagle on connection to {addr}: {e}");
        }
        let (mut reader, writer) = stream.into_split();
        let queue = core.open_queue();
        core.set_drain(tokio::spawn(drain_to_writer(queue, writer)))
            .await;

        info!("connected to {addr}");
        core.mark_connected();

        let mut buf = vec![0u8; READ_CHUNK];
        let mut read_error = None;
        loop {
            tokio::select! {
                _ = &mut kill.signal => {
                    debug!("disconnect requested for {addr}");
                    break;
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("connection to {addr} closed by remote side");
                        break;
                    }
                    Ok(n) => core.receive(&buf[..n]),
                    Err(e) => {
                        warn!("read error on connection to {addr}: {e}");
                        read_error = Some(e);
                        break;
                    }
                },
            }
        }

        core.mark_disconnected();
        core.shutdown_queue().await;
        core.finish_attempt()?;
        match read_error {
            Some(e) => Err(TransportError::Io(e)),
            None => Ok(()),
        }
    }
}

/// Writes queued frames to `writer` until `Stop`, a closed queue, or a
/// failed or stalled write.
pub(crate) async fn drain_to_writer<W>(mut queue: mpsc::Receiver<Outbound>, mut writer: W)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(item) = queue.recv().await {
        let frame = match item {
            Outbound::Frame(frame) => frame,
            Outbound::Stop => break,
        };
        match time::timeout(WRITE_TIMEOUT, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("write failed; discarding remaining outbound records: {e}");
                break;
            }
            Err(_) => {
                warn!("write stalled for {WRITE_TIMEOUT:?}; discarding remaining outbound records");
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("writer shutdown: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session::SessionLink;
    use remote_core::{callback, events, Fields};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_drain_writes_frames_in_order_and_stops_on_sentinel() {
        // Arrange
        let (tx, rx) = mpsc::channel(8);
        let (client, mut server) = tokio::io::duplex(1024);
        tx.send(Outbound::Frame(b"one\n".to_vec())).await.unwrap();
        tx.send(Outbound::Frame(b"two\n".to_vec())).await.unwrap();
        tx.send(Outbound::Stop).await.unwrap();
        tx.send(Outbound::Frame(b"never\n".to_vec())).await.unwrap();

        // Act
        drain_to_writer(rx, client).await;
        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();

        // Assert
        assert_eq!(written, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_failed_connect_publishes_connection_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = TcpTransport::new(TcpTransportConfig::new(addr.to_string()));
        let failures = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&failures);
        transport.callbacks().register(
            events::TRANSPORT_CONNECTION_FAILED,
            callback(move |_| {
                *sink.lock().unwrap() += 1;
                Ok(())
            }),
        );

        let result = transport.run().await;

        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
        assert_eq!(*failures.lock().unwrap(), 1);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_run_exchanges_records_and_returns_on_remote_close() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = Arc::new(TcpTransport::new(TcpTransportConfig::new(addr.to_string())));
        let greeted = Arc::downgrade(&transport);
        transport.callbacks().register(
            events::TRANSPORT_CONNECTED,
            callback(move |_| {
                if let Some(t) = greeted.upgrade() {
                    t.send("protocol_version", &Fields::new());
                }
                Ok(())
            }),
        );
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport.callbacks().register(
            "msg_speak",
            callback(move |fields| {
                sink.lock().unwrap().push(fields.clone());
                Ok(())
            }),
        );

        // Act
        let runner = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.run().await }
        });
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let first = lines.next_line().await.unwrap();
        write_half
            .write_all(b"{\"type\":\"speak\",\"sequence\":[\"Hi\"]}\n")
            .await
            .unwrap();
        drop(write_half);
        drop(lines);
        let result = runner.await.unwrap();

        // Assert
        assert_eq!(first.as_deref(), Some("{\"type\":\"protocol_version\"}"));
        assert!(result.is_ok());
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(transport.successful_connects(), 1);
        assert!(!transport.is_connected());
    }
}
