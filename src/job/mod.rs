//! Jobs back every ticketed stream. A read job feeds `(row, partition key)`
//! callbacks into a consumer installed by the producer; a write job waits for
//! the incoming put stream to assemble a [`BatchStore`] and then builds graph
//! structures from it.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Notify};

use crate::action::message::JobMessage;
use crate::core::PlexusError;
use crate::record::BoxRow;
use crate::store::BatchStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Job lifecycle. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    Initializing = 0,
    Pending = 1,
    Producing = 2,
    Complete = 3,
    Error = 4,
    Cancelled = 5,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled)
    }

    fn from_u8(raw: u8) -> JobStatus {
        match raw {
            0 => JobStatus::Initializing,
            1 => JobStatus::Pending,
            2 => JobStatus::Producing,
            3 => JobStatus::Complete,
            4 => JobStatus::Error,
            _ => JobStatus::Cancelled,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Initializing => "INITIALIZING",
            JobStatus::Pending => "PENDING",
            JobStatus::Producing => "PRODUCING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Error => "ERROR",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Shared state of a job: status word plus a completion signal.
pub struct JobCore {
    mode: Mode,
    status: AtomicU8,
    done: watch::Sender<bool>,
}

impl JobCore {
    fn new(mode: Mode) -> Arc<JobCore> {
        let (done, _) = watch::channel(false);
        Arc::new(JobCore {
            mode,
            status: AtomicU8::new(JobStatus::Initializing as u8),
            done,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Move to `next` unless the job already reached a terminal state.
    /// Returns whether the transition happened.
    pub fn advance(&self, next: JobStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if JobStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if next.is_terminal() {
            self.done.send_replace(true);
        }
        true
    }

    pub fn complete(&self) -> bool {
        self.advance(JobStatus::Complete)
    }

    pub fn fail(&self) -> bool {
        self.advance(JobStatus::Error)
    }

    /// Idempotent: the first call wins, later calls return false.
    pub fn cancel(&self) -> bool {
        self.advance(JobStatus::Cancelled)
    }

    /// Resolves once the job reaches any terminal state.
    pub async fn completed(&self) {
        let mut rx = self.done.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Receives `(row, partition key)` callbacks. Implemented by the partitioned
/// builder pool; the trait keeps the job side free of any back-pointer to the
/// producer.
#[async_trait]
pub trait RowConsumer: Send + Sync {
    async fn accept(&self, row: BoxRow, key: u64) -> Result<(), PlexusError>;
}

/// One-shot slot the producer fills when the stream is opened. Feeder tasks
/// park on it until then.
pub struct ConsumerSlot {
    cell: OnceLock<Arc<dyn RowConsumer>>,
    ready: Notify,
}

impl ConsumerSlot {
    fn new() -> Arc<ConsumerSlot> {
        Arc::new(ConsumerSlot {
            cell: OnceLock::new(),
            ready: Notify::new(),
        })
    }

    fn install(&self, consumer: Arc<dyn RowConsumer>) -> Result<(), PlexusError> {
        self.cell
            .set(consumer)
            .map_err(|_| PlexusError::Internal("consumer already installed".into()))?;
        self.ready.notify_waiters();
        Ok(())
    }

    async fn wait(&self) -> Arc<dyn RowConsumer> {
        loop {
            let notified = self.ready.notified();
            if let Some(consumer) = self.cell.get() {
                return Arc::clone(consumer);
            }
            notified.await;
        }
    }
}

pub struct ReadJob {
    core: Arc<JobCore>,
    first: Mutex<Option<oneshot::Receiver<BoxRow>>>,
    slot: Arc<ConsumerSlot>,
}

impl std::fmt::Debug for ReadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadJob").finish_non_exhaustive()
    }
}

impl ReadJob {
    /// Returns the job handle kept in the ticket directory and the binding
    /// handed to the row source.
    pub fn create() -> (Arc<ReadJob>, ReadBinding) {
        let core = JobCore::new(Mode::Read);
        let (first_tx, first_rx) = oneshot::channel();
        let slot = ConsumerSlot::new();
        let job = Arc::new(ReadJob {
            core: Arc::clone(&core),
            first: Mutex::new(Some(first_rx)),
            slot: Arc::clone(&slot),
        });
        let binding = ReadBinding {
            core,
            first: Some(first_tx),
            slot,
        };
        (job, binding)
    }

    pub fn core(&self) -> &Arc<JobCore> {
        &self.core
    }

    /// First record of the stream, used for schema discovery. Resolving it
    /// does not consume the row from the stream. Single-shot.
    pub async fn first_record(&self) -> Result<BoxRow, PlexusError> {
        let rx = self
            .first
            .lock()
            .expect("first-record slot poisoned")
            .take()
            .ok_or_else(|| PlexusError::Internal("first record already awaited".into()))?;
        rx.await
            .map_err(|_| PlexusError::Cancelled("job finished before first record".into()))
    }

    /// Install the consumer; parked feeder tasks start delivering rows.
    pub fn consume(&self, consumer: Arc<dyn RowConsumer>) -> Result<(), PlexusError> {
        self.slot.install(consumer)
    }

    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }
}

/// The row source's side of a read job.
pub struct ReadBinding {
    core: Arc<JobCore>,
    first: Option<oneshot::Sender<BoxRow>>,
    slot: Arc<ConsumerSlot>,
}

impl ReadBinding {
    pub fn core(&self) -> Arc<JobCore> {
        Arc::clone(&self.core)
    }

    /// Resolve the first-record future. Later calls are no-ops.
    pub fn offer_first(&mut self, row: BoxRow) {
        if let Some(tx) = self.first.take() {
            let _ = tx.send(row);
        }
    }

    /// Wait for the producer to install a consumer. Returns `None` when the
    /// job reaches a terminal state first (e.g. cancelled before the client
    /// ever opened the stream).
    pub async fn consumer(&self) -> Option<Arc<dyn RowConsumer>> {
        tokio::select! {
            consumer = self.slot.wait() => Some(consumer),
            _ = self.core.completed() => None,
        }
    }

    pub fn complete(&self) -> bool {
        self.core.complete()
    }

    pub fn fail(&self) -> bool {
        self.core.fail()
    }
}

pub struct WriteJob {
    core: Arc<JobCore>,
    store_slot: Mutex<Option<oneshot::Sender<BatchStore>>>,
}

impl std::fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteJob").finish_non_exhaustive()
    }
}

impl WriteJob {
    pub fn create() -> (Arc<WriteJob>, WriteBinding) {
        let core = JobCore::new(Mode::Write);
        let (store_tx, store_rx) = oneshot::channel();
        let job = Arc::new(WriteJob {
            core: Arc::clone(&core),
            store_slot: Mutex::new(Some(store_tx)),
        });
        let binding = WriteBinding {
            core,
            store: store_rx,
        };
        (job, binding)
    }

    pub fn core(&self) -> &Arc<JobCore> {
        &self.core
    }

    /// Hand the fully-assembled store to the write task. Fails if a put
    /// stream already completed for this ticket.
    pub fn complete_stream(&self, store: BatchStore) -> Result<(), PlexusError> {
        let tx = self
            .store_slot
            .lock()
            .expect("store slot poisoned")
            .take()
            .ok_or_else(|| {
                PlexusError::InvalidArgument("stream already completed for this ticket".into())
            })?;
        tx.send(store)
            .map_err(|_| PlexusError::Internal("write job is no longer waiting".into()))
    }
}

/// The write task's side of a write job.
pub struct WriteBinding {
    core: Arc<JobCore>,
    store: oneshot::Receiver<BatchStore>,
}

impl WriteBinding {
    pub fn core(&self) -> Arc<JobCore> {
        Arc::clone(&self.core)
    }

    /// Yields the assembled store once the incoming stream ends.
    pub async fn stream_completion(self) -> Result<BatchStore, PlexusError> {
        self.store
            .await
            .map_err(|_| PlexusError::Cancelled("put stream never completed".into()))
    }
}

#[derive(Debug, Clone)]
pub enum Job {
    Read(Arc<ReadJob>),
    Write(Arc<WriteJob>),
}

impl Job {
    pub fn core(&self) -> &Arc<JobCore> {
        match self {
            Job::Read(job) => job.core(),
            Job::Write(job) => job.core(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.core().mode()
    }

    pub fn cancel(&self) -> bool {
        self.core().cancel()
    }
}

/// Seam to the collaborator that owns the actual data source: the in-memory
/// graph catalog in this crate, or an external driver in an embedding.
#[async_trait]
pub trait JobCreator: Send + Sync {
    async fn new_job(
        &self,
        message: JobMessage,
        mode: Mode,
        identity: &str,
    ) -> Result<Job, PlexusError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Row, Value, ValueRow};

    #[test]
    fn test_status_transitions_and_stickiness() {
        let core = JobCore::new(Mode::Read);
        assert_eq!(core.status(), JobStatus::Initializing);
        assert!(core.advance(JobStatus::Pending));
        assert!(core.advance(JobStatus::Producing));
        assert!(core.complete());
        // Terminal states are sticky.
        assert!(!core.advance(JobStatus::Producing));
        assert!(!core.cancel());
        assert_eq!(core.status(), JobStatus::Complete);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let core = JobCore::new(Mode::Read);
        assert!(core.cancel());
        assert!(!core.cancel());
        assert_eq!(core.status(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_completed_resolves_on_terminal() {
        let core = JobCore::new(Mode::Read);
        let waiter = {
            let core = Arc::clone(&core);
            tokio::spawn(async move { core.completed().await })
        };
        core.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_record_round_trip() {
        let (job, mut binding) = ReadJob::create();
        binding.offer_first(Box::new(ValueRow::from_pairs(vec![(
            "id",
            Value::Int64(7),
        )])));
        let row = job.first_record().await.unwrap();
        assert_eq!(row.get_named("id"), Some(Value::Int64(7)));
        // Single-shot.
        assert!(job.first_record().await.is_err());
    }

    #[tokio::test]
    async fn test_first_record_fails_when_binding_dropped() {
        let (job, binding) = ReadJob::create();
        drop(binding);
        assert!(matches!(
            job.first_record().await,
            Err(PlexusError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_consumer_slot_delivery() {
        struct Collect(std::sync::Mutex<Vec<u64>>);
        #[async_trait]
        impl RowConsumer for Collect {
            async fn accept(&self, _row: BoxRow, key: u64) -> Result<(), PlexusError> {
                self.0.lock().unwrap().push(key);
                Ok(())
            }
        }

        let (job, binding) = ReadJob::create();
        let collect = Arc::new(Collect(std::sync::Mutex::new(Vec::new())));
        job.consume(Arc::clone(&collect) as Arc<dyn RowConsumer>)
            .unwrap();

        let consumer = binding.consumer().await.unwrap();
        consumer
            .accept(
                Box::new(ValueRow::from_pairs(vec![("id", Value::Int64(0))])),
                3,
            )
            .await
            .unwrap();
        assert_eq!(*collect.0.lock().unwrap(), vec![3]);

        // A second install is rejected.
        assert!(job.consume(collect as Arc<dyn RowConsumer>).is_err());
    }

    #[tokio::test]
    async fn test_consumer_wait_aborts_on_cancel() {
        let (job, binding) = ReadJob::create();
        job.cancel();
        assert!(binding.consumer().await.is_none());
    }

    #[tokio::test]
    async fn test_write_stream_completion() {
        use crate::memory::Allocator;
        use arrow::datatypes::{DataType, Field, Schema};

        let (job, binding) = WriteJob::create();
        let root = Allocator::root("root", u64::MAX);
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)]));
        let store = BatchStore::new(schema, &root, "t", u64::MAX);
        job.complete_stream(store).unwrap();

        let store = binding.stream_completion().await.unwrap();
        assert_eq!(store.row_count(), 0);
    }
}
