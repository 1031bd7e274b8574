//! Network Server
//!
//! TCP accept loop. Each connection is served on its own task; every
//! received frame is answered with exactly one reply frame produced by
//! the installed handler.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::{read_message, write_message};
use crate::error::Result;
use crate::replication::Message;

/// Message handler implemented by data nodes and the arbiter
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, peer: &str, message: Message) -> Message;
}

/// Network server for pair communication and client requests
pub struct NetServer {
    /// Bind address
    bind_address: String,
    /// Message handler
    handler: Arc<dyn MessageHandler>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetServer {
    pub fn new(bind_address: String, handler: Arc<dyn MessageHandler>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the listener. Split from `serve` so callers can fail fast on
    /// an occupied port before spawning.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Listening on {}", self.bind_address);
        Ok(listener)
    }

    /// Run the accept loop until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = self.handler.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handler).await {
                                    tracing::debug!("Connection from {} closed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Server on {} shutting down", self.bind_address);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the accept loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    loop {
        let (mut reader, mut writer) = socket.split();

        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            // Peer hung up between requests
            Err(e) => return Err(e),
        };

        tracing::trace!("{} -> {}", peer_addr, message.type_name());
        let reply = handler.handle(peer_addr, message).await;
        write_message(&mut writer, &reply).await?;
    }
}
