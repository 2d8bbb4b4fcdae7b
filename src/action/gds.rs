use std::sync::Arc;

use arrow_flight::{Action, ActionType};
use async_trait::async_trait;
use log::info;

use crate::action::message::{
    GdsMessage, GdsWriteNodeMessage, JobMessage, ENTITY_NODE, ENTITY_RELATIONSHIPS,
};
use crate::action::{spawn_schema_inference, ActionHandler, Outcome};
use crate::core::PlexusError;
use crate::flight::Producer;
use crate::job::{Job, JobCreator, Mode};

pub const NODE_READ_ACTION: &str = "gdsNodeProperties";
pub const RELS_READ_ACTION: &str = "gdsRelProperties";
pub const NODE_WRITE_ACTION: &str = "gds.write.nodes";

/// Streams properties out of (and node writes into) a named graph
/// projection.
pub struct GdsActionHandler {
    creator: Arc<dyn JobCreator>,
}

impl GdsActionHandler {
    pub fn new(creator: Arc<dyn JobCreator>) -> GdsActionHandler {
        GdsActionHandler { creator }
    }

    async fn handle_read(
        &self,
        producer: &Arc<Producer>,
        identity: &str,
        mut message: GdsMessage,
        entity: &str,
    ) -> Outcome {
        // The action type is authoritative for the entity kind.
        message.entity = entity.to_string();

        let job = match self
            .creator
            .new_job(JobMessage::GdsRead(message), Mode::Read, identity)
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
        spawn_schema_inference(Arc::clone(producer), ticket.clone(), read);
        Outcome::success(ticket.to_vec())
    }

    async fn handle_node_write(
        &self,
        producer: &Arc<Producer>,
        identity: &str,
        message: GdsWriteNodeMessage,
    ) -> Outcome {
        let job = match self
            .creator
            .new_job(JobMessage::GdsWriteNodes(message), Mode::Write, identity)
            .await
        {
            Ok(job) => job,
            Err(err) => return Outcome::failure(err),
        };
        if !matches!(job, Job::Write(_)) {
            return Outcome::failure(PlexusError::Internal(
                "job creator returned a read job for a write action".into(),
            ));
        }
        let ticket = producer.ticket_job(job).await;
        Outcome::success(ticket.to_vec())
    }
}

#[async_trait]
impl ActionHandler for GdsActionHandler {
    fn action_types(&self) -> Vec<String> {
        vec![
            NODE_READ_ACTION.to_string(),
            RELS_READ_ACTION.to_string(),
            NODE_WRITE_ACTION.to_string(),
        ]
    }

    fn action_descriptions(&self) -> Vec<ActionType> {
        vec![
            ActionType {
                r#type: NODE_READ_ACTION.to_string(),
                description: "Stream node properties from a graph projection".to_string(),
            },
            ActionType {
                r#type: RELS_READ_ACTION.to_string(),
                description: "Stream relationship properties from a graph projection".to_string(),
            },
            ActionType {
                r#type: NODE_WRITE_ACTION.to_string(),
                description: "Write nodes and properties into a graph projection".to_string(),
            },
        ]
    }

    async fn handle(&self, action: &Action, producer: &Arc<Producer>, identity: &str) -> Outcome {
        info!("user '{identity}' attempting a GDS action: {}", action.r#type);
        match action.r#type.as_str() {
            NODE_READ_ACTION => match GdsMessage::deserialize(&action.body) {
                Ok(message) => {
                    self.handle_read(producer, identity, message, ENTITY_NODE)
                        .await
                }
                Err(err) => Outcome::failure(err),
            },
            RELS_READ_ACTION => match GdsMessage::deserialize(&action.body) {
                Ok(message) => {
                    self.handle_read(producer, identity, message, ENTITY_RELATIONSHIPS)
                        .await
                }
                Err(err) => Outcome::failure(err),
            },
            NODE_WRITE_ACTION => match GdsWriteNodeMessage::deserialize(&action.body) {
                Ok(message) => self.handle_node_write(producer, identity, message).await,
                Err(err) => Outcome::failure(err),
            },
            other => Outcome::failure(PlexusError::NotFound(format!(
                "unsupported action {other}"
            ))),
        }
    }
}
