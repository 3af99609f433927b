use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};

use crate::codec::{read_frame, write_frame};
use crate::protocol::{RpcRequest, RpcResponse};
use crate::{Config, Result};

/// Application side of the RPC server.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

pub struct Server {
    listener: TcpListener,
    permits: Arc<Semaphore>,
}

impl Server {
    /// Binds the listener. Port 0 picks an ephemeral port; see [`Server::local_addr`].
    pub async fn bind(config: &Config) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_ip, config.port)).await?;
        tracing::info!("RPC server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Each connection gets its own read task; each request
    /// runs on its own task, bounded by `max_concurrent_requests`.
    pub async fn serve(self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let handler = handler.clone();
            let permits = self.permits.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, handler, permits).await {
                    tracing::debug!("Connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    handler: Arc<dyn RequestHandler>,
    permits: Arc<Semaphore>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let peer = socket.peer_addr()?;
    let (mut read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &response).await {
                tracing::debug!("Failed to write response to {}: {}", peer, e);
                break;
            }
        }
    });

    tracing::debug!("Accepted connection from {}", peer);

    let result = loop {
        match read_frame::<_, RpcRequest>(&mut read_half).await {
            Ok(Some(request)) => {
                let handler = handler.clone();
                let permits = permits.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    let correlation_id = request.correlation_id.clone();
                    tracing::trace!("Handling {} from {}", request.command, peer);
                    let response = handler
                        .handle(request)
                        .await
                        .with_correlation_id(correlation_id);
                    let _ = tx.send(response);
                });
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    // in-flight handlers still hold senders; the writer drains them and exits
    drop(tx);
    let _ = writer.await;
    result
}
