use std::sync::Arc;

use arrow_flight::{Action, ActionType};
use async_trait::async_trait;
use log::info;

use crate::action::message::{CypherMessage, JobMessage};
use crate::action::{spawn_schema_inference, ActionHandler, Outcome};
use crate::core::PlexusError;
use crate::flight::Producer;
use crate::job::{Job, JobCreator, Mode};

pub const CYPHER_READ_ACTION: &str = "cypherRead";

/// Creates read jobs from Cypher messages through the configured job
/// creator.
pub struct CypherActionHandler {
    creator: Arc<dyn JobCreator>,
}

impl CypherActionHandler {
    pub fn new(creator: Arc<dyn JobCreator>) -> CypherActionHandler {
        CypherActionHandler { creator }
    }
}

#[async_trait]
impl ActionHandler for CypherActionHandler {
    fn action_types(&self) -> Vec<String> {
        vec![CYPHER_READ_ACTION.to_string()]
    }

    fn action_descriptions(&self) -> Vec<ActionType> {
        vec![ActionType {
            r#type: CYPHER_READ_ACTION.to_string(),
            description: "Stream the results of a Cypher query".to_string(),
        }]
    }

    async fn handle(&self, action: &Action, producer: &Arc<Producer>, identity: &str) -> Outcome {
        let message = match CypherMessage::deserialize(&action.body) {
            Ok(message) => message,
            Err(err) => return Outcome::failure(err),
        };
        info!("user '{identity}' starting a cypher read");

        let job = match self
            .creator
            .new_job(JobMessage::Cypher(message), Mode::Read, identity)
            .await
        {
            Ok(job) => job,
            Err(err) => return Outcome::failure(err),
        };
        let Job::Read(read) = job.clone() else {
            return Outcome::failure(PlexusError::Internal(
                "job creator returned a write job for a read action".into(),
            ));
        };

        let ticket = producer.ticket_job(job).await;
        // The final schema is only known once the first record arrives.
        spawn_schema_inference(Arc::clone(producer), ticket.clone(), read);
        Outcome::success(ticket.to_vec())
    }
}
