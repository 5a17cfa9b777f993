//! Exchange data server
//!
//! TCP server producers run to serve their result partitions to remote
//! consumers. Each connection gets its own task: inbound control messages
//! (`PartitionRequest`, `AddCredit`, ...) feed the connection's
//! [`PartitionRequestQueue`], and the same task drains the queue onto the
//! socket, one buffer per turn, pausing whenever the transport applies
//! backpressure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gridflow_core::{InputChannelId, ResultPartitionId, SubpartitionIndexSet};
use gridflow_partition::{BufferAvailabilityListener, ResultPartition, SubpartitionView};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::message::{Message, MessageCodec};
use crate::queue::PartitionRequestQueue;
use crate::reader::CreditBasedViewReader;

/// Resolves partition requests to subpartition views. The server is generic
/// over this seam so tests and embedders can plug in their own registry.
#[async_trait]
pub trait ResultPartitionProvider: Send + Sync {
    /// Open one view per subpartition in `subpartitions`, in index order.
    async fn create_subpartition_views(
        &self,
        partition_id: ResultPartitionId,
        subpartitions: SubpartitionIndexSet,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> NetworkResult<Vec<Box<dyn SubpartitionView>>>;

    /// Consumer acknowledged that all user records of these subpartitions
    /// were processed.
    async fn acknowledge_all_records_processed(
        &self,
        partition_id: ResultPartitionId,
        subpartitions: SubpartitionIndexSet,
    );
}

/// In-process registry of the partitions this executor currently produces.
#[derive(Default)]
pub struct LocalPartitionProvider {
    partitions: RwLock<HashMap<ResultPartitionId, Arc<ResultPartition>>>,
}

impl LocalPartitionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, partition: Arc<ResultPartition>) {
        self.partitions.write().await.insert(partition.id(), partition);
    }

    pub async fn unregister(&self, partition_id: ResultPartitionId) -> Option<Arc<ResultPartition>> {
        self.partitions.write().await.remove(&partition_id)
    }

    pub async fn get(&self, partition_id: ResultPartitionId) -> Option<Arc<ResultPartition>> {
        self.partitions.read().await.get(&partition_id).cloned()
    }
}

#[async_trait]
impl ResultPartitionProvider for LocalPartitionProvider {
    async fn create_subpartition_views(
        &self,
        partition_id: ResultPartitionId,
        subpartitions: SubpartitionIndexSet,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> NetworkResult<Vec<Box<dyn SubpartitionView>>> {
        let partition = self
            .get(partition_id)
            .await
            .ok_or(NetworkError::PartitionNotFound(partition_id))?;
        if !subpartitions.is_valid_for(partition.num_subpartitions()) {
            return Err(NetworkError::Protocol(format!(
                "subpartition set {}..{} out of range for {} subpartitions",
                subpartitions.start(),
                subpartitions.end(),
                partition.num_subpartitions()
            )));
        }
        let mut views = Vec::with_capacity(subpartitions.len());
        for index in subpartitions.iter() {
            views.push(partition.create_subpartition_view(index as usize, listener.clone())?);
        }
        Ok(views)
    }

    async fn acknowledge_all_records_processed(
        &self,
        partition_id: ResultPartitionId,
        subpartitions: SubpartitionIndexSet,
    ) {
        if let Some(partition) = self.get(partition_id).await {
            for index in subpartitions.iter() {
                partition.on_subpartition_all_data_processed(index as usize);
            }
        }
    }
}

/// Data server configuration.
#[derive(Debug, Clone)]
pub struct DataServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6121".to_string(),
        }
    }
}

struct ServerState {
    provider: Arc<dyn ResultPartitionProvider>,
}

/// The exchange data server.
pub struct DataServer;

impl DataServer {
    /// Bind the listener; serve with [`BoundDataServer::run`].
    pub async fn bind(
        config: DataServerConfig,
        provider: Arc<dyn ResultPartitionProvider>,
    ) -> NetworkResult<BoundDataServer> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("data server listening on {}", local_addr);
        Ok(BoundDataServer {
            listener,
            state: Arc::new(ServerState { provider }),
        })
    }
}

/// A data server bound to its port.
pub struct BoundDataServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl BoundDataServer {
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        self.listener.local_addr().map_err(NetworkError::from)
    }

    /// Accept connections until the process ends.
    pub async fn run(self) -> NetworkResult<()> {
        loop {
            self.accept_one().await?;
        }
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run_until(
        self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> NetworkResult<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.accept_one() => result?,
                _ = &mut shutdown => {
                    info!("data server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn accept_one(&self) -> NetworkResult<()> {
        match self.listener.accept().await {
            Ok((stream, addr)) => {
                let state = self.state.clone();
                tokio::spawn(async move {
                    match handle_connection(stream, addr, state).await {
                        Ok(()) | Err(NetworkError::ConnectionClosed) => {
                            debug!("connection closed: {}", addr);
                        }
                        Err(e) => {
                            warn!("connection error from {}: {}", addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
        Ok(())
    }
}

/// Availability callback handed to subpartition views: forwards the
/// receiver id into the connection task's notification channel.
struct ChannelListener {
    receiver_id: InputChannelId,
    tx: mpsc::UnboundedSender<InputChannelId>,
}

impl BufferAvailabilityListener for ChannelListener {
    fn notify_data_available(&self) {
        let _ = self.tx.send(self.receiver_id);
    }
}

/// Handle a single consumer connection.
#[instrument(skip(stream, state), fields(client = %addr))]
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> NetworkResult<()> {
    debug!("new consumer connection from {}", addr);

    let (read_half, write_half) = stream.into_split();
    let mut inbound = FramedRead::new(read_half, MessageCodec::new());
    let mut outbound = FramedWrite::new(write_half, MessageCodec::new());

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<InputChannelId>();
    let mut queue = PartitionRequestQueue::new();
    // receiver id -> (partition, subpartition set), for routing acks.
    let mut receivers: HashMap<InputChannelId, (ResultPartitionId, SubpartitionIndexSet)> =
        HashMap::new();

    loop {
        // Drain ready readers first; the send await is the transport
        // backpressure point and bounds internal queueing to one frame.
        while queue.has_available() {
            match queue.poll_next()? {
                Some(message) => outbound.send(message).await?,
                None => break,
            }
        }

        tokio::select! {
            inbound_frame = inbound.next() => {
                let message = match inbound_frame {
                    None => return Ok(()),
                    Some(Err(e)) => {
                        // Connection-fatal: report with a nil receiver id,
                        // then tear the connection down.
                        let _ = outbound
                            .send(Message::ErrorResponse {
                                receiver_id: None,
                                kind: e.error_kind(),
                                message: e.to_string(),
                            })
                            .await;
                        return Err(e);
                    }
                    Some(Ok(message)) => message,
                };
                handle_message(
                    message,
                    &state,
                    &mut queue,
                    &mut receivers,
                    &notify_tx,
                    &mut outbound,
                )
                .await?;
            }
            Some(receiver_id) = notify_rx.recv() => {
                queue.notify_data_available(receiver_id);
            }
        }
    }
}

async fn handle_message(
    message: Message,
    state: &Arc<ServerState>,
    queue: &mut PartitionRequestQueue,
    receivers: &mut HashMap<InputChannelId, (ResultPartitionId, SubpartitionIndexSet)>,
    notify_tx: &mpsc::UnboundedSender<InputChannelId>,
    outbound: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, MessageCodec>,
) -> NetworkResult<()> {
    match message {
        Message::PartitionRequest {
            partition_id,
            subpartitions,
            receiver_id,
            initial_credit,
        } => {
            debug!(
                partition = %partition_id,
                receiver = %receiver_id,
                initial_credit,
                "partition request"
            );
            let listener = Arc::new(ChannelListener {
                receiver_id,
                tx: notify_tx.clone(),
            });
            match state
                .provider
                .create_subpartition_views(partition_id, subpartitions, listener)
                .await
            {
                Ok(views) => {
                    queue.register(CreditBasedViewReader::new(
                        receiver_id,
                        views,
                        initial_credit,
                    ));
                    receivers.insert(receiver_id, (partition_id, subpartitions));
                }
                Err(e) if e.is_connection_fatal() => return Err(e),
                Err(e) => {
                    // Receiver-scoped: this consumer fails, the connection
                    // and its other receivers stay usable.
                    warn!(receiver = %receiver_id, "partition request failed: {e}");
                    outbound
                        .send(Message::ErrorResponse {
                            receiver_id: Some(receiver_id),
                            kind: e.error_kind(),
                            message: e.to_string(),
                        })
                        .await?;
                }
            }
        }
        Message::AddCredit {
            receiver_id,
            credit,
        } => {
            queue.add_credit(receiver_id, credit);
        }
        Message::ResumeConsumption { receiver_id } => {
            queue.resume_consumption(receiver_id);
        }
        Message::NewBufferSize { receiver_id, size } => {
            queue.notify_new_buffer_size(receiver_id, size);
        }
        Message::AckAllUserRecordsProcessed { receiver_id } => {
            if let Some((partition_id, subpartitions)) = receivers.get(&receiver_id) {
                state
                    .provider
                    .acknowledge_all_records_processed(*partition_id, *subpartitions)
                    .await;
            }
        }
        Message::CloseRequest { receiver_id } => {
            queue.close_receiver(receiver_id);
            receivers.remove(&receiver_id);
        }
        Message::BufferResponse { .. } | Message::ErrorResponse { .. } => {
            return Err(NetworkError::Protocol(
                "response message received on server side".to_string(),
            ));
        }
    }
    Ok(())
}
