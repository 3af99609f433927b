use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use storage::CacheEntry;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{read_frame, write_frame};
use crate::command::Command;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::{NetworkError, NodeAddress, Result};

type Pending = Arc<DashMap<String, oneshot::Sender<RpcResponse>>>;

/// A persistent connection to one peer.
///
/// Requests are written by a dedicated writer task; a single reader task
/// matches responses to callers by correlation id. Callers never touch the
/// socket directly, so a slow caller cannot stall the read path.
pub struct PeerClient {
    address: NodeAddress,
    outbound: mpsc::UnboundedSender<RpcRequest>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerClient {
    pub async fn connect(address: NodeAddress, request_timeout: Duration) -> Result<Self> {
        let socket = tokio::time::timeout(
            request_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| NetworkError::Timeout(format!("connecting to {}", address)))?
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", address, e)))?;
        socket.set_nodelay(true)?;

        let (mut read_half, mut write_half) = socket.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<RpcRequest>();
        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer = {
            let closed = closed.clone();
            let address = address.clone();
            tokio::spawn(async move {
                while let Some(request) = rx.recv().await {
                    if let Err(e) = write_frame(&mut write_half, &request).await {
                        tracing::warn!("Failed to write request to {}: {}", address, e);
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
            })
        };

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            let address = address.clone();
            tokio::spawn(async move {
                loop {
                    match read_frame::<_, RpcResponse>(&mut read_half).await {
                        Ok(Some(response)) => match pending.remove(&response.correlation_id) {
                            Some((_, sender)) => {
                                let _ = sender.send(response);
                            }
                            None => tracing::warn!(
                                "Dropping response from {} with unknown correlation id '{}'",
                                address,
                                response.correlation_id
                            ),
                        },
                        Ok(None) => {
                            tracing::debug!("Connection to {} closed by peer", address);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to read from {}: {}", address, e);
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // dropping the senders fails every outstanding call
                pending.clear();
            })
        };

        tracing::debug!("Connected to peer {}", address);

        Ok(Self {
            address,
            outbound: tx,
            pending,
            closed,
            request_timeout,
            reader,
            writer,
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Sends `request` and waits for the response carrying its correlation id.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed(self.address.to_string()));
        }

        let correlation_id = request.correlation_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        // the reader may have shut down between the check above and the insert
        if self.is_closed() || self.outbound.send(request).is_err() {
            self.pending.remove(&correlation_id);
            return Err(NetworkError::ConnectionClosed(self.address.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::ConnectionClosed(self.address.to_string())),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(NetworkError::Timeout(format!(
                    "no response from {} for request {}",
                    self.address, correlation_id
                )))
            }
        }
    }

    pub async fn send(&self, command: Command) -> Result<RpcResponse> {
        self.call(RpcRequest::new(command)).await
    }

    /// Parses and sends a text command.
    pub async fn execute(&self, text: &str) -> Result<RpcResponse> {
        self.call(RpcRequest::parse(text)?).await
    }

    /// Sends `entries` as PUT commands of at most `batch_size` entries each.
    /// Every batch is retried up to `max_retries` times; the call fails if
    /// any batch never got an OK.
    pub async fn put_all(
        &self,
        entries: &[CacheEntry],
        node_version: Option<u64>,
        batch_size: usize,
        max_retries: usize,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let batches: Vec<_> = entries.chunks(batch_size.max(1)).collect();
        let total = batches.len();

        let results = join_all(batches.into_iter().map(|batch| async move {
            let command = Command::put_entries(batch);
            for attempt in 1..=max_retries.max(1) {
                let mut request = RpcRequest::new(command.clone());
                request.node_version = node_version;
                match self.call(request).await {
                    Ok(response) if response.is_ok() => return true,
                    Ok(response) => tracing::debug!(
                        "PUT batch to {} answered {} (attempt {})",
                        self.address,
                        response.status,
                        attempt
                    ),
                    Err(e) => tracing::debug!(
                        "PUT batch to {} failed: {} (attempt {})",
                        self.address,
                        e,
                        attempt
                    ),
                }
            }
            false
        }))
        .await;

        let failed = results.iter().filter(|ok| !**ok).count();
        if failed > 0 {
            tracing::warn!("{} of {} PUT batches to {} failed", failed, total, self.address);
            return Err(NetworkError::BatchFailed { failed, total });
        }
        Ok(())
    }

    /// Stops both connection tasks and fails every pending call.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
        self.pending.clear();
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
