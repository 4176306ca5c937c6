//! TCP server: accept loop and per-client tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting client connections and registering each with the
//!    [`RelayService`].
//! 3. Running two tasks per client:
//!    - **Reader**: splits the byte stream into lines with a
//!      [`LineFramer`] and hands each line to the service.
//!    - **Writer**: drains the client's outbox onto the socket.
//! 4. Shutting down when the `running` flag is cleared.
//!
//! A client whose writer stalls for longer than [`WRITE_TIMEOUT`] loses its
//! remaining queued records; its reader keeps going until the socket closes.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use remote_core::{LineFramer, PeerId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::application::{Disposition, RelayService};
use crate::domain::RelayConfig;

/// Longest a single frame write may take before the client's outbox is
/// abandoned.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const READ_BUFFER_SIZE: usize = 16 * 1024;

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds the relay listener.
///
/// # Errors
///
/// Returns an error if the address is in use or cannot be bound.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {addr}"))
}

/// Binds `config.bind_addr` and serves until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(config: RelayConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = bind(config.bind_addr).await?;
    info!("relay listening on {}", config.bind_addr);
    serve(listener, Arc::new(RelayService::new(config)), running).await
}

/// Accepts clients on `listener` until `running` is cleared, then drops
/// every client's outbox so their writers flush and close.
///
/// # Errors
///
/// Currently infallible once the listener exists; accept errors are logged
/// and the loop continues.
pub async fn serve(
    listener: TcpListener,
    service: Arc<RelayService>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the flag is re-checked while nobody connects.
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    handle_client(stream, peer_addr, service).await;
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }

    service.disconnect_all();
    Ok(())
}

// ── Per-client handling ───────────────────────────────────────────────────────

async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, service: Arc<RelayService>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("{peer_addr}: set_nodelay failed: {e}");
    }
    let (reader, writer) = stream.into_split();

    let (outbox, frames) = mpsc::channel(service.config().send_queue_capacity.max(1));
    let id = service.connect(outbox);
    info!("client {id} connected from {peer_addr}");

    let writer_task = tokio::spawn(write_frames(frames, writer));
    read_lines(reader, id, &service).await;

    // Dropping the service's outbox lets the writer flush what is queued
    // (a `version_mismatch`, say) and then close the socket.
    service.disconnect(id);
    if let Err(e) = writer_task.await {
        warn!("client {id}: writer task failed: {e}");
    }
    info!("client {id} ({peer_addr}) disconnected");
}

async fn read_lines<R>(mut reader: R, id: PeerId, service: &RelayService)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!("client {id}: read error: {e}");
                return;
            }
        };
        for line in framer.push(&buf[..n]) {
            if service.handle_line(id, &line) == Disposition::Disconnect {
                return;
            }
        }
    }
}

async fn write_frames<W>(mut frames: mpsc::Receiver<Vec<u8>>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        match timeout(WRITE_TIMEOUT, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("write failed: {e}");
                break;
            }
            Err(_) => {
                warn!("write stalled for {WRITE_TIMEOUT:?}; dropping queued records");
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("writer shutdown: {e}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn start_relay() -> (SocketAddr, Arc<RelayService>, Arc<AtomicBool>) {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Arc::new(RelayService::new(RelayConfig::default()));
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(serve(listener, Arc::clone(&service), Arc::clone(&running)));
        (addr, service, running)
    }

    async fn wait_for_clients(service: &RelayService, count: usize) {
        for _ in 0..100 {
            if service.client_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} client(s), have {}", service.client_count());
    }

    #[tokio::test]
    async fn test_write_frames_writes_in_order_then_shuts_down() {
        // Arrange
        let (tx, rx) = mpsc::channel(4);
        let (client, server) = tokio::io::duplex(1024);
        tx.send(b"a\n".to_vec()).await.unwrap();
        tx.send(b"b\n".to_vec()).await.unwrap();
        drop(tx);

        // Act
        write_frames(rx, server).await;

        // Assert
        let mut received = String::new();
        BufReader::new(client).read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "a\nb\n");
    }

    #[tokio::test]
    async fn test_version_mismatch_is_flushed_before_close() {
        // Arrange
        let (addr, service, _running) = start_relay().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();

        // Act
        write_half
            .write_all(b"{\"type\":\"protocol_version\",\"version\":1}\n")
            .await
            .unwrap();

        // Assert
        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"type":"version_mismatch"}"#);
        assert_eq!(lines.next_line().await.unwrap(), None);
        wait_for_clients(&service, 0).await;
    }

    #[tokio::test]
    async fn test_records_split_across_writes_are_routed() {
        // Arrange
        let (addr, service, _running) = start_relay().await;
        let a = TcpStream::connect(addr).await.unwrap();
        let b = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&service, 2).await;
        let (a_read, mut a_write) = a.into_split();
        let (_b_read, mut b_write) = b.into_split();
        let mut a_lines = BufReader::new(a_read).lines();

        a_write
            .write_all(b"{\"type\":\"join\",\"channel\":\"k\",\"connection_type\":\"controller\"}\n")
            .await
            .unwrap();
        a_lines.next_line().await.unwrap().unwrap(); // channel_joined
        b_write
            .write_all(b"{\"type\":\"join\",\"channel\":\"k\",\"connection_type\":\"controlled\"}\n")
            .await
            .unwrap();
        a_lines.next_line().await.unwrap().unwrap(); // client_joined

        // Act
        b_write.write_all(b"{\"type\":\"spe").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        b_write.write_all(b"ak\",\"sequence\":[\"hi\"]}\n").await.unwrap();

        // Assert
        let line = a_lines.next_line().await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(record["type"], "speak");
        assert_eq!(record["sequence"][0], "hi");
        assert!(record["origin"].is_i64());
    }

    #[tokio::test]
    async fn test_clearing_running_closes_clients() {
        // Arrange
        let (addr, service, running) = start_relay().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&service, 1).await;
        let (read_half, _write_half) = stream.into_split();

        // Act
        running.store(false, Ordering::Relaxed);

        // Assert
        let mut lines = BufReader::new(read_half).lines();
        let closed = timeout(Duration::from_secs(2), lines.next_line()).await;
        assert!(matches!(closed, Ok(Ok(None))));
    }

    #[tokio::test]
    async fn test_bind_reports_address_in_use() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let err = bind(addr).await.unwrap_err();

        assert!(err.to_string().contains("failed to bind relay listener"));
    }
}
