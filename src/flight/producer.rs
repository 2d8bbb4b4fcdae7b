//! Ticket, job and flight directories plus the per-stream orchestration that
//! ties the builder pool and the flush pipeline together.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow_flight::{ActionType, FlightDescriptor, FlightEndpoint, FlightInfo, Ticket};
use bytes::Bytes;
use log::{error, info, warn};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::action::ActionHandler;
use crate::core::{Config, PlexusError};
use crate::flight::flush;
use crate::flight::pool::{BuilderPool, ErrorLatch};
use crate::job::{Job, JobStatus, ReadJob, RowConsumer};
use crate::memory::Allocator;

/// Tickets are 16 opaque bytes (random UUID), unique per process.
pub const TICKET_LENGTH: usize = 16;

struct FlightEntry {
    info: FlightInfo,
    schema: SchemaRef,
}

/// Owns the ticket directories and the producer-level allocator. Streams are
/// process-local; there is no multi-process ticket support.
pub struct Producer {
    config: Arc<Config>,
    allocator: Allocator,
    flights: RwLock<HashMap<Bytes, FlightEntry>>,
    jobs: RwLock<HashMap<Bytes, Job>>,
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl Producer {
    pub fn new(root: &Allocator, config: Arc<Config>) -> Arc<Producer> {
        // The status handler is always available.
        let status: Arc<dyn ActionHandler> = Arc::new(crate::action::StatusHandler);
        let handlers: HashMap<String, Arc<dyn ActionHandler>> = status
            .action_types()
            .into_iter()
            .map(|action_type| (action_type, Arc::clone(&status)))
            .collect();
        Arc::new(Producer {
            config,
            allocator: root.child("flight-producer", u64::MAX),
            flights: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            handlers: RwLock::new(handlers),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Associate every action type the handler declares with it.
    pub async fn register_handler(&self, handler: Arc<dyn ActionHandler>) {
        let mut handlers = self.handlers.write().await;
        for action_type in handler.action_types() {
            handlers.insert(action_type, Arc::clone(&handler));
        }
    }

    pub async fn handler(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.read().await.get(action_type).cloned()
    }

    /// Distinct action descriptions across all registered handlers.
    pub async fn action_descriptions(&self) -> Vec<ActionType> {
        let handlers = self.handlers.read().await;
        let mut distinct: BTreeMap<String, ActionType> = BTreeMap::new();
        for handler in handlers.values() {
            for description in handler.action_descriptions() {
                distinct.insert(description.r#type.clone(), description);
            }
        }
        distinct.into_values().collect()
    }

    /// Mint a fresh ticket for the job and remember the mapping.
    pub async fn ticket_job(&self, job: Job) -> Bytes {
        let ticket = Bytes::copy_from_slice(Uuid::new_v4().as_bytes());
        self.jobs.write().await.insert(ticket.clone(), job);
        ticket
    }

    pub async fn job(&self, ticket: &[u8]) -> Option<Job> {
        self.jobs.read().await.get(ticket).cloned()
    }

    pub async fn flight_info(&self, ticket: &[u8]) -> Option<FlightInfo> {
        self.flights
            .read()
            .await
            .get(ticket)
            .map(|entry| entry.info.clone())
    }

    pub async fn stream_schema(&self, ticket: &[u8]) -> Option<SchemaRef> {
        self.flights
            .read()
            .await
            .get(ticket)
            .map(|entry| Arc::clone(&entry.schema))
    }

    pub async fn list_flight_infos(&self) -> Vec<FlightInfo> {
        self.flights
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub async fn flight_count(&self) -> usize {
        self.flights.read().await.len()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Publish the flight for a ticketed job and flip it to `Producing`.
    ///
    /// The job status changes only after the flight directory is updated,
    /// otherwise a concurrent stream open could race the publication.
    pub async fn set_flight_info(
        &self,
        ticket: &Bytes,
        schema: SchemaRef,
    ) -> Result<(), PlexusError> {
        let job = self
            .job(ticket)
            .await
            .ok_or_else(|| PlexusError::Internal("no job for flight".into()))?;
        let status = job.core().status();
        if !matches!(status, JobStatus::Initializing | JobStatus::Pending) {
            return Err(PlexusError::Internal(format!(
                "cannot publish flight for job in state {status}"
            )));
        }

        let info = FlightInfo::new()
            .try_with_schema(schema.as_ref())
            .map_err(|e| PlexusError::Internal(e.to_string()))?
            .with_descriptor(FlightDescriptor::new_cmd(ticket.clone()))
            .with_endpoint(FlightEndpoint::new().with_ticket(Ticket {
                ticket: ticket.clone(),
            }))
            .with_total_records(-1)
            .with_total_bytes(-1);
        self.flights
            .write()
            .await
            .insert(ticket.clone(), FlightEntry { info, schema });

        job.core().advance(JobStatus::Producing);
        info!("published flight for ticket {}", ticket_name(ticket));
        Ok(())
    }

    /// Remove the ticket from both directories. Idempotent.
    pub async fn delete_flight(&self, ticket: &[u8]) {
        info!("deleting flight for ticket {}", ticket_name(ticket));
        self.flights.write().await.remove(ticket);
        self.jobs.write().await.remove(ticket);
    }

    pub(crate) async fn remove_flight_info(&self, ticket: &[u8]) {
        self.flights.write().await.remove(ticket);
    }

    /// Cancel every job and tear the directories down.
    pub async fn close(&self) {
        for job in self.jobs.read().await.values() {
            job.cancel();
        }
        self.jobs.write().await.clear();
        self.flights.write().await.clear();
        if let Err(err) = self.allocator.close() {
            warn!("{err}");
        }
    }
}

fn ticket_name(ticket: &[u8]) -> String {
    Uuid::from_slice(ticket)
        .map(|uuid| uuid.to_string())
        .unwrap_or_else(|_| format!("{ticket:02x?}"))
}

/// Drive one read stream to completion. Runs detached from the RPC handler;
/// the response stream observes record batches (and at most one error)
/// through `out`.
pub(crate) async fn run_read_stream(
    producer: Arc<Producer>,
    ticket: Bytes,
    job: Arc<ReadJob>,
    schema: SchemaRef,
    out: mpsc::Sender<Result<RecordBatch, PlexusError>>,
) {
    let config = Arc::clone(producer.config());
    let stream_id = ticket_name(&ticket);
    let base = producer
        .allocator()
        .child(format!("stream-{stream_id}"), config.max_stream_memory);
    let transmit = producer
        .allocator()
        .child(format!("transmit-{stream_id}"), config.max_stream_memory);

    let latch = Arc::new(ErrorLatch::new());
    let is_feeding = Arc::new(AtomicBool::new(true));
    let (work_tx, work_rx) = mpsc::channel(config.max_partitions.max(2));
    let pool = BuilderPool::new(
        Arc::clone(&schema),
        &base,
        transmit.clone(),
        config.batch_size,
        config.max_partitions,
        work_tx,
        Arc::clone(&latch),
        Arc::clone(job.core()),
    );
    let mut pipeline = tokio::spawn(flush::run(
        schema,
        work_rx,
        Arc::clone(&is_feeding),
        out.clone(),
        Arc::clone(&latch),
        Arc::clone(job.core()),
    ));

    match job.consume(Arc::clone(&pool) as Arc<dyn RowConsumer>) {
        Ok(()) => {
            // Block until the job has prepared all data for the stream. A
            // dropped receiver means the client went away; that is the
            // cancel hook.
            tokio::select! {
                _ = job.core().completed() => {}
                _ = out.closed() => {
                    info!("client disconnected or cancelled stream {stream_id}");
                    if latch.latch(PlexusError::Cancelled("client disconnected".into())) {
                        job.cancel();
                    }
                    job.core().completed().await;
                }
            }

            // Controlled shutdown flushes stragglers; error paths skip
            // straight to the drain.
            if latch.get().is_none() && job.core().status() == JobStatus::Complete {
                if let Err(err) = pool.flush_stragglers().await {
                    error!("straggler flush failed: {err}");
                    latch.latch(err);
                }
            }
        }
        // A second stream against the same ticket fails on its own without
        // touching the job that feeds the first one.
        Err(err) => {
            latch.latch(err);
        }
    }

    is_feeding.store(false, Ordering::Release);
    match tokio::time::timeout(config.flush_timeout, &mut pipeline).await {
        Ok(_) => info!("flushing complete for stream {stream_id}"),
        Err(_) => {
            error!(
                "flush pipeline for stream {stream_id} did not drain within {:?}",
                config.flush_timeout
            );
            pipeline.abort();
            latch.latch(PlexusError::Internal(
                "flush pipeline drain timed out".into(),
            ));
        }
    }

    // Exactly one terminal event per stream: an error item, or a clean end
    // of stream when `out` drops below.
    if let Some(err) = latch.get() {
        let _ = out.send(Err(err)).await;
    } else if job.core().status() == JobStatus::Cancelled {
        let _ = out.send(Err(PlexusError::Cancelled("job cancelled".into()))).await;
    }

    // Allocators close leaves first; a drain timeout may surface leaks here,
    // which is fatal to the stream anyway.
    pool.close().await;
    for allocator in [&base, &transmit] {
        if let Err(err) = allocator.close() {
            warn!("{err}");
        }
    }
    producer.remove_flight_info(&ticket).await;
    info!("finished stream for ticket {stream_id}");
}
