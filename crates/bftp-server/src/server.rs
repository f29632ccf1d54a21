//! TCP accept loop and per-connection plumbing.
//!
//! One task per connection owns the `Session` and the read half; a companion
//! writer task drains the connection's packet channel into the socket, so a
//! slow peer only ever blocks its own connection.

use std::sync::Arc;

use anyhow::Result;
use bftp_store::FileStore;
use bftp_wire::{ErrorCode, Framer, Packet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectionId, Registry};
use crate::session::Session;

/// Accept connections until ctrl_c. Connection ids are monotonic for the
/// life of the process and never reused.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    store: Arc<FileStore>,
) -> Result<()> {
    let mut next_id: ConnectionId = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        next_id += 1;
                        let id = next_id;
                        info!(connection = id, peer = %addr, "accepted connection");
                        tokio::spawn(handle_connection(
                            stream,
                            id,
                            Arc::clone(&registry),
                            Arc::clone(&store),
                        ));
                    }
                    Err(e) => error!("accept failed: {e}"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    id: ConnectionId,
    registry: Arc<Registry>,
    store: Arc<FileStore>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    registry.register(id, tx);

    let writer_task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if writer.write_all(&packet.encode()).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut session = Session::new(id, Arc::clone(&registry), Arc::clone(&store));
    let mut framer = Framer::new();
    let mut buf = [0u8; 1024];

    'connection: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(connection = id, "socket read failed: {e}");
                break;
            }
        };
        for &byte in &buf[..n] {
            match framer.feed(byte) {
                Ok(Some(packet)) => {
                    session.process(packet).await;
                    if session.should_terminate() {
                        break 'connection;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    warn!(connection = id, "framing violation, closing: {e}");
                    break 'connection;
                }
                Err(e) => {
                    debug!(connection = id, "{e}");
                    registry.send(
                        id,
                        Packet::Error {
                            code: ErrorCode::IllegalOperation,
                            message: "illegal operation".to_string(),
                        },
                    );
                }
            }
        }
    }

    session.close().await;
    registry.unregister(id);
    // All senders are gone now; the writer drains queued replies (the DISC
    // ack in particular) and exits.
    let _ = writer_task.await;
    info!(connection = id, "connection closed");
}
