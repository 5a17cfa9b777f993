//! Result Partition - One Producing Task's Output
//!
//! A `ResultPartition` owns N subpartitions, a local buffer pool, and the
//! per-subpartition write cursors. The producing task appends serialized
//! records; records larger than a page span multiple buffers transparently.
//!
//! ## State Machine
//!
//! ```text
//! Created ──(writes)──> Finished ──(consumed)──> Released
//!    └──────────────────────(cancellation)──────────^
//! ```
//!
//! `finish()` is called once; afterwards no more buffers may be added.
//! `release()` reclaims all memory and disk resources, is idempotent, and is
//! safe to call concurrently with in-flight reads — readers observe
//! `PartitionReleased` rather than corrupt state.
//!
//! ## End-of-Data Signalling
//!
//! `notify_end_of_data` broadcasts the end-of-data event to every
//! subpartition; `all_data_processed()` resolves once every subpartition has
//! been fully consumed (acknowledged by its consumer) or discarded. That
//! future is the producer's signal that it is safe to terminate.
//!
//! ## Threads
//!
//! Exactly one producer thread appends and calls `finish`/`flush`. Transport
//! threads drain views in parallel; for bounded-blocking subpartitions they
//! never run concurrently with production into the same subpartition (reads
//! are only possible after `finish`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use gridflow_core::{
    Buffer, BufferBuilder, BufferConsumer, BufferPool, Compression, EventKind, NetworkConfig,
    ResultPartitionId,
};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::bounded::{BoundedBlockingSubpartition, BoundedStorageKind};
use crate::compression::BufferCompressor;
use crate::error::{Error, Result};
use crate::pipelined::PipelinedSubpartition;
use crate::view::{BufferAvailabilityListener, SubpartitionSnapshot, SubpartitionView};

/// How this partition's data is exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultPartitionType {
    /// In-memory, low-latency streaming exchange.
    Pipelined,
    /// Disk-backed, replayable batch exchange.
    BoundedBlocking,
}

/// How an end-of-data notification stops the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Drain all in-flight data before stopping.
    Drain,
    /// Stop without draining (e.g. suspend with savepoint).
    NoDrain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Created,
    Finished,
    Released,
}

enum Subpartition {
    Pipelined(Arc<PipelinedSubpartition>),
    Bounded(Arc<BoundedBlockingSubpartition>),
}

/// Per-subpartition write cursor.
#[derive(Default)]
struct CurrentWriter {
    builder: Option<BufferBuilder>,
    /// For bounded subpartitions the consumer stays here until the page is
    /// full and spilled; pipelined consumers are enqueued immediately.
    consumer: Option<BufferConsumer>,
}

/// One producing task's partitioned output.
pub struct ResultPartition {
    id: ResultPartitionId,
    partition_type: ResultPartitionType,
    subpartitions: Vec<Subpartition>,
    writers: Vec<Mutex<CurrentWriter>>,
    pool: BufferPool,
    compressor: Option<BufferCompressor>,
    state: StdMutex<PartitionState>,
    processed_flags: Vec<AtomicBool>,
    processed_tx: watch::Sender<bool>,
    end_of_data: StdMutex<Option<StopMode>>,
}

impl ResultPartition {
    pub fn new(
        id: ResultPartitionId,
        partition_type: ResultPartitionType,
        num_subpartitions: usize,
        storage_kind: BoundedStorageKind,
        config: &NetworkConfig,
    ) -> Result<Self> {
        assert!(num_subpartitions > 0, "partition needs at least one subpartition");

        let mut subpartitions = Vec::with_capacity(num_subpartitions);
        for index in 0..num_subpartitions as u32 {
            let subpartition = match partition_type {
                ResultPartitionType::Pipelined => {
                    Subpartition::Pipelined(Arc::new(PipelinedSubpartition::new(id, index)))
                }
                ResultPartitionType::BoundedBlocking => {
                    let path = config.spill_dir.join(format!("{id}-{index}.spill"));
                    Subpartition::Bounded(Arc::new(BoundedBlockingSubpartition::new(
                        id,
                        index,
                        path,
                        config.region_size,
                        storage_kind,
                    )?))
                }
            };
            subpartitions.push(subpartition);
        }

        // Compression only runs on the spill path, never on the pipelined
        // hot path.
        let compressor = match (partition_type, config.compression) {
            (ResultPartitionType::BoundedBlocking, codec @ Compression::Lz4) => {
                Some(BufferCompressor::new(codec))
            }
            _ => None,
        };

        let (processed_tx, _) = watch::channel(false);
        Ok(Self {
            id,
            partition_type,
            writers: (0..num_subpartitions).map(|_| Mutex::new(CurrentWriter::default())).collect(),
            subpartitions,
            pool: BufferPool::new(config.page_size, config.buffers_per_pool),
            compressor,
            state: StdMutex::new(PartitionState::Created),
            processed_flags: (0..num_subpartitions).map(|_| AtomicBool::new(false)).collect(),
            processed_tx,
            end_of_data: StdMutex::new(None),
        })
    }

    pub fn id(&self) -> ResultPartitionId {
        self.id
    }

    pub fn partition_type(&self) -> ResultPartitionType {
        self.partition_type
    }

    pub fn num_subpartitions(&self) -> usize {
        self.subpartitions.len()
    }

    pub fn state(&self) -> PartitionState {
        *self.state.lock().unwrap()
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Append one serialized record to a subpartition. Records larger than a
    /// page span multiple buffers; blocks when the pool is exhausted (this
    /// is the upstream backpressure path).
    pub async fn append_record(&self, subpartition: usize, record: &[u8]) -> Result<()> {
        self.check_subpartition(subpartition)?;
        self.check_producing()?;
        let mut writer = self.writers[subpartition].lock().await;

        let mut remaining = record;
        while !remaining.is_empty() {
            if writer.builder.is_none() {
                // A builder created mid-record starts with continuation
                // bytes of the spanning record.
                let partial = if remaining.len() < record.len() {
                    remaining.len().min(self.pool.page_size())
                } else {
                    0
                };
                let builder = self.pool.request_buffer_builder().await?;
                match &self.subpartitions[subpartition] {
                    Subpartition::Pipelined(p) => {
                        p.add(builder.create_consumer(), partial)?;
                    }
                    Subpartition::Bounded(_) => {
                        writer.consumer = Some(builder.create_consumer());
                    }
                }
                writer.builder = Some(builder);
            }
            if let Some(builder) = writer.builder.as_ref() {
                let taken = builder.append(remaining);
                remaining = &remaining[taken..];
                if builder.is_full() {
                    self.finish_current_writer(subpartition, &mut writer)?;
                }
            }
        }
        Ok(())
    }

    /// Force delivery of the subpartition's in-progress buffer.
    pub async fn flush(&self, subpartition: usize) -> Result<()> {
        self.check_subpartition(subpartition)?;
        let mut writer = self.writers[subpartition].lock().await;
        match &self.subpartitions[subpartition] {
            Subpartition::Pipelined(p) => p.flush(),
            Subpartition::Bounded(b) => {
                self.finish_current_writer(subpartition, &mut writer)?;
                b.flush()?;
            }
        }
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<()> {
        for index in 0..self.subpartitions.len() {
            self.flush(index).await?;
        }
        Ok(())
    }

    /// Broadcast a control event to every subpartition. Events are
    /// record-aligned: current builders are finished first.
    pub async fn broadcast_event(&self, kind: EventKind) -> Result<()> {
        self.check_producing()?;
        for index in 0..self.subpartitions.len() {
            let mut writer = self.writers[index].lock().await;
            self.finish_current_writer(index, &mut writer)?;
            match &self.subpartitions[index] {
                Subpartition::Pipelined(p) => {
                    p.add(BufferConsumer::from_event(kind), 0)?;
                }
                Subpartition::Bounded(b) => {
                    b.add_buffer(&Buffer::event(kind))?;
                }
            }
        }
        Ok(())
    }

    /// Mark all user records as emitted. `all_data_processed()` resolves
    /// once every consumer has acknowledged.
    pub async fn notify_end_of_data(&self, mode: StopMode) -> Result<()> {
        {
            let mut end_of_data = self.end_of_data.lock().unwrap();
            if end_of_data.is_some() {
                return Ok(());
            }
            *end_of_data = Some(mode);
        }
        self.broadcast_event(EventKind::EndOfData {
            drain: mode == StopMode::Drain,
        })
        .await
    }

    /// Close the partition for writing: seal every subpartition behind an
    /// end-of-partition event.
    pub async fn finish(&self) -> Result<()> {
        self.check_producing()?;
        for index in 0..self.subpartitions.len() {
            let mut writer = self.writers[index].lock().await;
            self.finish_current_writer(index, &mut writer)?;
            match &self.subpartitions[index] {
                Subpartition::Pipelined(p) => p.finish()?,
                Subpartition::Bounded(b) => {
                    b.add_buffer(&Buffer::event(EventKind::EndOfPartition))?;
                    b.finish()?;
                }
            }
        }
        *self.state.lock().unwrap() = PartitionState::Finished;
        debug!(partition = %self.id, "result partition finished");
        Ok(())
    }

    /// The stop mode announced via `notify_end_of_data`, if any.
    pub fn end_of_data_mode(&self) -> Option<StopMode> {
        *self.end_of_data.lock().unwrap()
    }

    /// Resolves once every subpartition was fully consumed or discarded.
    pub async fn all_data_processed(&self) {
        let mut rx = self.processed_tx.subscribe();
        // The sender lives as long as `self`, so this only fails if the
        // caller outlives the partition — treat that as "done".
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Consumer acknowledgement that one subpartition's user records were
    /// fully processed.
    pub fn on_subpartition_all_data_processed(&self, subpartition: usize) {
        let Some(flag) = self.processed_flags.get(subpartition) else {
            return;
        };
        if flag.swap(true, Ordering::AcqRel) {
            return;
        }
        if self
            .processed_flags
            .iter()
            .all(|f| f.load(Ordering::Acquire))
        {
            let _ = self.processed_tx.send(true);
        }
    }

    /// Open a read view over one subpartition.
    pub fn create_subpartition_view(
        &self,
        subpartition: usize,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Result<Box<dyn SubpartitionView>> {
        self.check_subpartition(subpartition)?;
        if self.state() == PartitionState::Released {
            return Err(Error::PartitionReleased);
        }
        match &self.subpartitions[subpartition] {
            Subpartition::Pipelined(p) => Ok(Box::new(p.create_read_view(listener)?)),
            Subpartition::Bounded(b) => Ok(Box::new(b.create_read_view(listener)?)),
        }
    }

    /// Capture in-flight buffers for a checkpoint, one snapshot per
    /// subpartition. Bounded-blocking data is already durable and snapshots
    /// empty.
    pub fn snapshot_state(&self, checkpoint_id: u64) -> Vec<SubpartitionSnapshot> {
        self.subpartitions
            .iter()
            .map(|sub| match sub {
                Subpartition::Pipelined(p) => p.snapshot_state(checkpoint_id),
                Subpartition::Bounded(_) => SubpartitionSnapshot::default(),
            })
            .collect()
    }

    /// Reclaim all memory and disk resources. Idempotent; reachable from
    /// any state (cancellation). In-flight readers observe
    /// `PartitionReleased`.
    pub fn release(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == PartitionState::Released {
                return;
            }
            *state = PartitionState::Released;
        }
        debug!(partition = %self.id, "releasing result partition");
        for sub in &self.subpartitions {
            match sub {
                Subpartition::Pipelined(p) => p.release(),
                Subpartition::Bounded(b) => b.release(),
            }
        }
        // The producer is stopped before release on cancellation, so the
        // write cursors are uncontended here.
        for writer in &self.writers {
            if let Ok(mut writer) = writer.try_lock() {
                writer.builder = None;
                writer.consumer = None;
            }
        }
        self.pool.destroy();
        // Discarded counts as processed for the termination future.
        let _ = self.processed_tx.send(true);
    }

    fn finish_current_writer(&self, index: usize, writer: &mut CurrentWriter) -> Result<()> {
        let Some(builder) = writer.builder.take() else {
            return Ok(());
        };
        builder.finish();
        match &self.subpartitions[index] {
            Subpartition::Pipelined(p) => p.on_buffer_finished(),
            Subpartition::Bounded(b) => {
                if let Some(mut consumer) = writer.consumer.take() {
                    if let Some(buffer) = consumer.build() {
                        let buffer = match &self.compressor {
                            Some(c) => c.compress_if_smaller(buffer),
                            None => buffer,
                        };
                        b.add_buffer(&buffer)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_subpartition(&self, index: usize) -> Result<()> {
        if index >= self.subpartitions.len() {
            return Err(Error::InvalidSubpartition {
                index,
                count: self.subpartitions.len(),
            });
        }
        Ok(())
    }

    fn check_producing(&self) -> Result<()> {
        match self.state() {
            PartitionState::Created => Ok(()),
            PartitionState::Finished => Err(Error::AddAfterFinish),
            PartitionState::Released => Err(Error::PartitionReleased),
        }
    }
}

impl std::fmt::Debug for ResultPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultPartition")
            .field("id", &self.id)
            .field("type", &self.partition_type)
            .field("subpartitions", &self.subpartitions.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> NetworkConfig {
        NetworkConfig {
            page_size: 64,
            buffers_per_pool: 8,
            region_size: 256,
            spill_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn noop_listener() -> Arc<dyn BufferAvailabilityListener> {
        Arc::new(|| {})
    }

    fn pipelined(dir: &tempfile::TempDir, subpartitions: usize) -> ResultPartition {
        ResultPartition::new(
            ResultPartitionId::new(),
            ResultPartitionType::Pipelined,
            subpartitions,
            BoundedStorageKind::FileChannel,
            &test_config(dir),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pipelined_append_flush_poll() {
        let dir = tempfile::tempdir().unwrap();
        let partition = pipelined(&dir, 2);

        partition.append_record(0, b"hello").await.unwrap();
        partition.append_record(1, b"world").await.unwrap();
        partition.flush_all().await.unwrap();

        let view0 = partition.create_subpartition_view(0, noop_listener()).unwrap();
        let view1 = partition.create_subpartition_view(1, noop_listener()).unwrap();
        assert_eq!(
            view0.poll_buffer().unwrap().unwrap().buffer.bytes().as_ref(),
            b"hello"
        );
        assert_eq!(
            view1.poll_buffer().unwrap().unwrap().buffer.bytes().as_ref(),
            b"world"
        );
    }

    #[tokio::test]
    async fn test_record_spanning_multiple_pages() {
        let dir = tempfile::tempdir().unwrap();
        let partition = pipelined(&dir, 1);

        // 200 bytes over 64-byte pages: four buffers.
        let record: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        partition.append_record(0, &record).await.unwrap();
        partition.finish().await.unwrap();

        let view = partition.create_subpartition_view(0, noop_listener()).unwrap();
        let mut reassembled = Vec::new();
        while let Some(item) = view.poll_buffer().unwrap() {
            if item.buffer.is_data() {
                reassembled.extend_from_slice(item.buffer.bytes());
            }
        }
        assert_eq!(reassembled, record);
    }

    #[tokio::test]
    async fn test_finish_then_append_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let partition = pipelined(&dir, 1);
        partition.finish().await.unwrap();
        assert_eq!(partition.state(), PartitionState::Finished);
        assert!(matches!(
            partition.append_record(0, b"late").await,
            Err(Error::AddAfterFinish)
        ));
    }

    #[tokio::test]
    async fn test_invalid_subpartition_index() {
        let dir = tempfile::tempdir().unwrap();
        let partition = pipelined(&dir, 2);
        assert!(matches!(
            partition.append_record(5, b"x").await,
            Err(Error::InvalidSubpartition { index: 5, count: 2 })
        ));
    }

    #[tokio::test]
    async fn test_release_reclaims_pool_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let partition = pipelined(&dir, 1);
        partition.append_record(0, b"data").await.unwrap();
        partition.flush(0).await.unwrap();
        assert!(partition.buffer_pool().num_outstanding() > 0);

        partition.release();
        partition.release();
        assert_eq!(partition.state(), PartitionState::Released);
        assert_eq!(partition.buffer_pool().num_outstanding(), 0);
        assert!(matches!(
            partition.append_record(0, b"x").await,
            Err(Error::PartitionReleased)
        ));
        assert!(partition.create_subpartition_view(0, noop_listener()).is_err());
    }

    #[tokio::test]
    async fn test_bounded_roundtrip_through_partition() {
        let dir = tempfile::tempdir().unwrap();
        let partition = ResultPartition::new(
            ResultPartitionId::new(),
            ResultPartitionType::BoundedBlocking,
            1,
            BoundedStorageKind::FileChannel,
            &test_config(&dir),
        )
        .unwrap();

        for i in 0..100u64 {
            partition.append_record(0, &i.to_be_bytes()).await.unwrap();
        }
        // Reads before finish are rejected.
        assert!(partition.create_subpartition_view(0, noop_listener()).is_err());
        partition.finish().await.unwrap();

        let view = partition.create_subpartition_view(0, noop_listener()).unwrap();
        let mut bytes = Vec::new();
        while let Some(item) = view.poll_buffer().unwrap() {
            if item.buffer.is_data() {
                bytes.extend_from_slice(item.buffer.bytes());
            } else {
                assert_eq!(item.buffer.event_kind().unwrap(), EventKind::EndOfPartition);
            }
        }
        let values: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_end_of_data_and_processed_future() {
        let dir = tempfile::tempdir().unwrap();
        let partition = Arc::new(pipelined(&dir, 2));
        partition.notify_end_of_data(StopMode::Drain).await.unwrap();

        let waiter = {
            let partition = partition.clone();
            tokio::spawn(async move { partition.all_data_processed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        partition.on_subpartition_all_data_processed(0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Duplicate acks must not complete the future early.
        partition.on_subpartition_all_data_processed(0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        partition.on_subpartition_all_data_processed(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_completes_processed_future() {
        let dir = tempfile::tempdir().unwrap();
        let partition = Arc::new(pipelined(&dir, 1));
        let waiter = {
            let partition = partition.clone();
            tokio::spawn(async move { partition.all_data_processed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        partition.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_of_data_event_carries_mode() {
        let dir = tempfile::tempdir().unwrap();
        let partition = pipelined(&dir, 1);
        assert_eq!(partition.end_of_data_mode(), None);
        partition.notify_end_of_data(StopMode::NoDrain).await.unwrap();
        assert_eq!(partition.end_of_data_mode(), Some(StopMode::NoDrain));

        let view = partition.create_subpartition_view(0, noop_listener()).unwrap();
        let item = view.poll_buffer().unwrap().unwrap();
        assert_eq!(
            item.buffer.event_kind().unwrap(),
            EventKind::EndOfData { drain: false }
        );
    }

    #[tokio::test]
    async fn test_snapshot_state_per_subpartition() {
        let dir = tempfile::tempdir().unwrap();
        let partition = pipelined(&dir, 2);
        partition.append_record(0, b"committed").await.unwrap();
        // Finish the open builder at a record boundary, as the checkpoint
        // path does before snapshotting.
        {
            let mut writer = partition.writers[0].lock().await;
            partition.finish_current_writer(0, &mut writer).unwrap();
        }

        let snapshots = partition.snapshot_state(1);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].buffers.len(), 1);
        assert_eq!(snapshots[0].buffers[0].bytes().as_ref(), b"committed");
        assert!(snapshots[1].buffers.is_empty());
    }
}
