//! Partitioned builder pool: stages rows into per-partition column builders
//! and flushes full batches into the work queue.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::{mpsc, Mutex};

use crate::column::{estimated_row_bytes, ColumnBuilder};
use crate::core::PlexusError;
use crate::job::{JobCore, JobStatus, RowConsumer};
use crate::memory::{Allocator, Reservation};
use crate::record::{BoxRow, Row, Value};

const ALLOCATION_RETRIES: usize = 1000;
const ALLOCATION_BACKOFF: Duration = Duration::from_millis(100);

/// First error on the stream wins; everything after it is dropped.
pub(crate) struct ErrorLatch {
    cell: OnceLock<PlexusError>,
}

impl ErrorLatch {
    pub fn new() -> ErrorLatch {
        ErrorLatch {
            cell: OnceLock::new(),
        }
    }

    /// Returns true when this call latched the error.
    pub fn latch(&self, err: PlexusError) -> bool {
        self.cell.set(err).is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get(&self) -> Option<PlexusError> {
        self.cell.get().cloned()
    }
}

/// A snapshot of one partition's built chunks, ownership already moved to the
/// transmit allocator.
pub(crate) struct FlushWork {
    pub vectors: Vec<ArrayRef>,
    pub rows: usize,
    #[allow(dead_code)] // held so the transmit accounting lives until transmit
    pub reservation: Reservation,
}

struct Partition {
    allocator: Allocator,
    builders: Option<Vec<ColumnBuilder>>,
    reservation: Option<Reservation>,
    rows: usize,
}

pub(crate) struct BuilderPool {
    schema: SchemaRef,
    batch_size: usize,
    partitions: Vec<Mutex<Partition>>,
    /// Serializes cross-partition ownership hand-off.
    transfer: Mutex<()>,
    transmit: Allocator,
    queue: mpsc::Sender<FlushWork>,
    latch: Arc<ErrorLatch>,
    job: Arc<JobCore>,
}

impl BuilderPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema: SchemaRef,
        base: &Allocator,
        transmit: Allocator,
        batch_size: usize,
        max_partitions: usize,
        queue: mpsc::Sender<FlushWork>,
        latch: Arc<ErrorLatch>,
        job: Arc<JobCore>,
    ) -> Arc<BuilderPool> {
        let partitions = (0..max_partitions.max(1))
            .map(|index| {
                Mutex::new(Partition {
                    allocator: base.child(format!("partition-{index}"), u64::MAX),
                    builders: None,
                    reservation: None,
                    rows: 0,
                })
            })
            .collect();
        Arc::new(BuilderPool {
            schema,
            batch_size,
            partitions,
            transfer: Mutex::new(()),
            transmit,
            queue,
            latch,
            job,
        })
    }

    async fn ensure_builders(&self, partition: &mut Partition) -> Result<(), PlexusError> {
        if partition.builders.is_none() {
            let builders = self
                .schema
                .fields()
                .iter()
                .map(|field| ColumnBuilder::for_field(field))
                .collect::<Result<Vec<_>, _>>()?;
            partition.builders = Some(builders);
        }
        if partition.reservation.is_none() {
            let estimate: u64 = self
                .schema
                .fields()
                .iter()
                .map(|field| estimated_row_bytes(field))
                .sum::<u64>()
                * self.batch_size as u64;
            let mut attempts = 0;
            let reservation = loop {
                match partition.allocator.reserve(estimate) {
                    Ok(reservation) => break reservation,
                    Err(err) => {
                        attempts += 1;
                        if attempts >= ALLOCATION_RETRIES {
                            return Err(err);
                        }
                        warn!(
                            "failed to allocate {estimate} bytes for '{}', retrying",
                            partition.allocator.name()
                        );
                        tokio::time::sleep(ALLOCATION_BACKOFF).await;
                    }
                }
            };
            partition.reservation = Some(reservation);
        }
        Ok(())
    }

    fn write_row(&self, partition: &mut Partition, row: &dyn Row) -> Result<(), PlexusError> {
        let builders = partition
            .builders
            .as_mut()
            .ok_or_else(|| PlexusError::Internal("builders not allocated".into()))?;
        for (index, builder) in builders.iter_mut().enumerate() {
            let value = row.get(index).unwrap_or(Value::Null);
            builder.append(&value)?;
        }
        Ok(())
    }

    /// Snapshot the partition's builders into the work queue. The transfer
    /// mutex is held only for the ownership hand-off, which is O(#fields).
    async fn flush_partition(
        &self,
        partition: &mut Partition,
        rows: usize,
    ) -> Result<(), PlexusError> {
        let vectors: Vec<ArrayRef> = {
            let _transfer = self.transfer.lock().await;
            let builders = partition
                .builders
                .as_mut()
                .ok_or_else(|| PlexusError::Internal("builders not allocated".into()))?;
            builders.iter_mut().map(|builder| builder.finish()).collect()
        };
        let bytes: u64 = vectors
            .iter()
            .map(|vector| vector.get_array_memory_size() as u64)
            .sum();
        let reservation = match partition.reservation.take() {
            Some(mut reservation) => {
                reservation.resize(bytes)?;
                reservation.transfer_to(&self.transmit)?
            }
            None => self.transmit.reserve(bytes)?,
        };
        partition.rows = 0;
        self.queue
            .send(FlushWork {
                vectors,
                rows,
                reservation,
            })
            .await
            .map_err(|_| PlexusError::Cancelled("flush queue closed".into()))
    }

    /// Flush every partition that still holds staged rows. Called once after
    /// the job completes.
    pub async fn flush_stragglers(&self) -> Result<(), PlexusError> {
        for slot in &self.partitions {
            let mut partition = slot.lock().await;
            let rows = partition.rows;
            if rows > 0 {
                self.flush_partition(&mut partition, rows).await?;
            }
        }
        Ok(())
    }

    /// Drop builders and close the per-partition allocators.
    pub async fn close(&self) {
        for slot in &self.partitions {
            let mut partition = slot.lock().await;
            partition.builders = None;
            partition.reservation = None;
            partition.rows = 0;
            if let Err(err) = partition.allocator.close() {
                warn!("{err}");
            }
        }
    }

    fn latch_error(&self, err: PlexusError) {
        if self.latch.latch(err) {
            self.job.cancel();
        }
    }
}

#[async_trait]
impl RowConsumer for BuilderPool {
    async fn accept(&self, row: BoxRow, key: u64) -> Result<(), PlexusError> {
        // After the first error (or an explicit cancel) rows are dropped.
        if self.latch.is_set() || self.job.status() == JobStatus::Cancelled {
            return Ok(());
        }
        let index = (key as usize) % self.partitions.len();
        let mut partition = self.partitions[index].lock().await;

        let result = async {
            if partition.rows == 0 {
                self.ensure_builders(&mut partition).await?;
            }
            self.write_row(&mut partition, row.as_ref())?;
            partition.rows += 1;
            if partition.rows == self.batch_size {
                self.flush_partition(&mut partition, self.batch_size).await?;
            }
            Ok::<(), PlexusError>(())
        }
        .await;

        if let Err(err) = result {
            error!("row processing failed: {err}");
            self.latch_error(err);
        }
        Ok(())
    }
}
