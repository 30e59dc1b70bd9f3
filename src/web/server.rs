// src/web/server.rs - Line-oriented TCP command channel
//! One command per line in, one reply line out. `status` is answered from
//! the published snapshot; everything else goes through the control loop's
//! mailbox.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast, mpsc};

use super::commands::UiCommand;
use super::machine_channel::MachineRequest;
use super::models::MachineSnapshot;

pub struct UiServer {
    listener: TcpListener,
    mailbox: mpsc::Sender<MachineRequest>,
    snapshot: Arc<RwLock<MachineSnapshot>>,
}

impl UiServer {
    pub fn new(
        listener: TcpListener,
        mailbox: mpsc::Sender<MachineRequest>,
        snapshot: Arc<RwLock<MachineSnapshot>>,
    ) -> Self {
        Self { listener, mailbox, snapshot }
    }

    /// Accept connections until shutdown is broadcast.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("UI channel listening on {}", addr),
            Err(e) => tracing::warn!("UI channel listening, address unknown: {}", e),
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            tracing::warn!("Failed to accept UI connection: {}", e);
                            continue;
                        }
                    };
                    tracing::info!("UI client {} connected", peer);
                    let mailbox = self.mailbox.clone();
                    let snapshot = self.snapshot.clone();
                    let shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, mailbox, snapshot, shutdown).await {
                            tracing::warn!("UI client {}: {}", peer, e);
                        }
                        tracing::info!("UI client {} disconnected", peer);
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("UI channel shutting down");
                    break;
                }
            }
        }
    }
}

/// Serve one client until it disconnects or shutdown is broadcast.
pub async fn handle_connection<S>(
    stream: S,
    mailbox: mpsc::Sender<MachineRequest>,
    snapshot: Arc<RwLock<MachineSnapshot>>,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.recv() => None,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let mut reply = respond(&line, &mailbox, &snapshot).await;
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn respond(line: &str, mailbox: &mpsc::Sender<MachineRequest>, snapshot: &RwLock<MachineSnapshot>) -> String {
    let command = match line.parse::<UiCommand>() {
        Ok(command) => command,
        Err(e) => return format!("error {}", e),
    };
    if command == UiCommand::Status {
        let snapshot = snapshot.read().await;
        return serde_json::to_string(&*snapshot).unwrap_or_else(|e| format!("error {}", e));
    }

    let (request, reply) = MachineRequest::new(command);
    if mailbox.send(request).await.is_err() {
        return "error machine unavailable".to_string();
    }
    reply.await.unwrap_or_else(|_| "error machine unavailable".to_string())
}
