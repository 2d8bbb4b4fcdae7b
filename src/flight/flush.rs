//! Single-consumer flush pipeline: turns built batch snapshots into record
//! batches headed for the wire encoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use log::debug;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::core::PlexusError;
use crate::flight::pool::{ErrorLatch, FlushWork};
use crate::job::JobCore;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Drains the work queue until `is_feeding` drops and the queue is empty.
/// Wire order equals enqueue order; the capacity-1 output channel keeps at
/// most one batch in flight toward the client.
pub(crate) async fn run(
    schema: SchemaRef,
    mut queue: mpsc::Receiver<FlushWork>,
    is_feeding: Arc<AtomicBool>,
    out: mpsc::Sender<Result<RecordBatch, PlexusError>>,
    latch: Arc<ErrorLatch>,
    job: Arc<JobCore>,
) {
    loop {
        match timeout(POLL_INTERVAL, queue.recv()).await {
            Ok(Some(work)) => transmit(&schema, work, &out, &latch, &job).await,
            Ok(None) => break,
            Err(_elapsed) => {
                if !is_feeding.load(Ordering::Acquire) {
                    // No producer will enqueue again; drain and exit.
                    while let Ok(work) = queue.try_recv() {
                        transmit(&schema, work, &out, &latch, &job).await;
                    }
                    break;
                }
            }
        }
    }
}

async fn transmit(
    schema: &SchemaRef,
    work: FlushWork,
    out: &mpsc::Sender<Result<RecordBatch, PlexusError>>,
    latch: &ErrorLatch,
    job: &JobCore,
) {
    // After the first error the remaining snapshots are only released, never
    // transmitted. Dropping `work` returns its transmit-side accounting.
    if latch.is_set() {
        return;
    }
    debug!("flushing {} rows", work.rows);
    let batch = match RecordBatch::try_new(schema.clone(), work.vectors.clone()) {
        Ok(batch) => batch,
        Err(err) => {
            if latch.latch(PlexusError::Internal(format!(
                "failed to assemble record batch: {err}"
            ))) {
                job.cancel();
            }
            return;
        }
    };
    if out.send(Ok(batch)).await.is_err() {
        // The encoder side is gone: the client disconnected.
        if latch.latch(PlexusError::Cancelled("client disconnected".into())) {
            job.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flight::pool::ErrorLatch;
    use crate::job::ReadJob;
    use crate::memory::Allocator;
    use arrow::array::{Array, ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)]))
    }

    fn work_of(allocator: &Allocator, values: &[i64]) -> FlushWork {
        let array: Int64Array = values.iter().copied().map(Some).collect();
        let vectors: Vec<ArrayRef> = vec![Arc::new(array)];
        let bytes: u64 = vectors.iter().map(|v| v.get_array_memory_size() as u64).sum();
        FlushWork {
            vectors,
            rows: values.len(),
            reservation: allocator.reserve(bytes).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_emission_order_equals_enqueue_order() {
        let root = Allocator::root("root", u64::MAX);
        let (work_tx, work_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let is_feeding = Arc::new(AtomicBool::new(true));
        let latch = Arc::new(ErrorLatch::new());
        let (job, _binding) = ReadJob::create();

        let pipeline = tokio::spawn(run(
            schema(),
            work_rx,
            Arc::clone(&is_feeding),
            out_tx,
            Arc::clone(&latch),
            Arc::clone(job.core()),
        ));

        work_tx.send(work_of(&root, &[1, 2])).await.unwrap();
        work_tx.send(work_of(&root, &[3])).await.unwrap();

        let first = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(first.num_rows(), 2);
        let second = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(second.num_rows(), 1);

        is_feeding.store(false, Ordering::Release);
        drop(work_tx);
        pipeline.await.unwrap();
        // All transmit-side reservations were released on the way out.
        assert_eq!(root.reserved(), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_latches_cancel() {
        let root = Allocator::root("root", u64::MAX);
        let (work_tx, work_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(1);
        let is_feeding = Arc::new(AtomicBool::new(true));
        let latch = Arc::new(ErrorLatch::new());
        let (job, _binding) = ReadJob::create();

        drop(out_rx);
        let pipeline = tokio::spawn(run(
            schema(),
            work_rx,
            Arc::clone(&is_feeding),
            out_tx,
            Arc::clone(&latch),
            Arc::clone(job.core()),
        ));

        work_tx.send(work_of(&root, &[1])).await.unwrap();
        is_feeding.store(false, Ordering::Release);
        drop(work_tx);
        pipeline.await.unwrap();

        assert!(matches!(latch.get(), Some(PlexusError::Cancelled(_))));
        assert_eq!(
            job.core().status(),
            crate::job::JobStatus::Cancelled
        );
        assert_eq!(root.reserved(), 0);
    }

    #[tokio::test]
    async fn test_exits_when_feeding_stops_and_queue_empty() {
        let root = Allocator::root("root", u64::MAX);
        let (work_tx, work_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let is_feeding = Arc::new(AtomicBool::new(false));
        let latch = Arc::new(ErrorLatch::new());
        let (job, _binding) = ReadJob::create();

        let pipeline = tokio::spawn(run(
            schema(),
            work_rx,
            is_feeding,
            out_tx,
            latch,
            Arc::clone(job.core()),
        ));
        // The sender stays alive: exit comes from the feeding flag, not from
        // channel closure.
        timeout(Duration::from_secs(5), pipeline)
            .await
            .expect("pipeline should exit on its own")
            .unwrap();
        drop(work_tx);
        assert_eq!(root.reserved(), 0);
    }
}
