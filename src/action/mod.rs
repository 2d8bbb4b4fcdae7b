pub mod message;

mod cypher;
mod gds;
mod status;

pub use cypher::{CypherActionHandler, CYPHER_READ_ACTION};
pub use gds::{GdsActionHandler, NODE_READ_ACTION, NODE_WRITE_ACTION, RELS_READ_ACTION};
pub use status::{StatusHandler, STATUS_ACTION};

use std::sync::Arc;

use arrow::datatypes::{Field, Schema};
use arrow_flight::{Action, ActionType};
use async_trait::async_trait;
use bytes::Bytes;
use log::error;

use crate::column::arrow_type_of;
use crate::core::PlexusError;
use crate::flight::Producer;
use crate::job::ReadJob;
use crate::record::Row;

/// Result of handling one action.
pub enum Outcome {
    Success(Vec<u8>),
    Failure(PlexusError),
}

impl Outcome {
    pub fn success(result: Vec<u8>) -> Outcome {
        Outcome::Success(result)
    }

    pub fn failure(err: PlexusError) -> Outcome {
        Outcome::Failure(err)
    }
}

/// Capability contract for pluggable action handlers: the types they answer
/// to, their descriptions, and the handling itself.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action_types(&self) -> Vec<String>;

    fn action_descriptions(&self) -> Vec<ActionType>;

    async fn handle(&self, action: &Action, producer: &Arc<Producer>, identity: &str) -> Outcome;
}

/// Build the stream schema from the first record. Every field is nullable;
/// array values map to fixed-size lists whose stride is the sample's length.
pub fn schema_from_row(row: &dyn Row) -> Result<Schema, PlexusError> {
    let keys = row.keys();
    if keys.is_empty() {
        return Err(PlexusError::InvalidArgument("record has no fields".into()));
    }
    let mut fields = Vec::with_capacity(keys.len());
    for (index, name) in keys.iter().enumerate() {
        let value = row.get(index).ok_or_else(|| {
            PlexusError::InvalidArgument(format!("record missing value for field '{name}'"))
        })?;
        fields.push(Field::new(name, arrow_type_of(&value)?, true));
    }
    Ok(Schema::new(fields))
}

/// Wait for the job's first record, publish the inferred schema, and flip
/// the job to producing. Failures tear the flight down.
pub(crate) fn spawn_schema_inference(producer: Arc<Producer>, ticket: Bytes, job: Arc<ReadJob>) {
    tokio::spawn(async move {
        match job.first_record().await {
            Ok(row) => match schema_from_row(row.as_ref()) {
                Ok(schema) => {
                    if let Err(err) = producer.set_flight_info(&ticket, Arc::new(schema)).await {
                        error!("failed to publish flight info: {err}");
                        producer.delete_flight(&ticket).await;
                    }
                }
                Err(err) => {
                    error!("schema inference failed: {err}");
                    job.core().fail();
                    producer.delete_flight(&ticket).await;
                }
            },
            // The job died before yielding anything.
            Err(_) => producer.delete_flight(&ticket).await,
        }
    });
}
