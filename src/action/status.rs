use std::sync::Arc;

use arrow_flight::{Action, ActionType};
use async_trait::async_trait;
use serde::Serialize;

use crate::action::{ActionHandler, Outcome};
use crate::core::PlexusError;
use crate::flight::{Producer, TICKET_LENGTH};

pub const STATUS_ACTION: &str = "status";

#[derive(Serialize)]
struct ServerStatus {
    name: &'static str,
    version: &'static str,
    flights: usize,
    jobs: usize,
    actions: Vec<String>,
}

/// With an empty body, answers a server-status blob. With a serialized
/// ticket as the body, answers that job's status string so clients can poll
/// for `PRODUCING`.
pub struct StatusHandler;

#[async_trait]
impl ActionHandler for StatusHandler {
    fn action_types(&self) -> Vec<String> {
        vec![STATUS_ACTION.to_string()]
    }

    fn action_descriptions(&self) -> Vec<ActionType> {
        vec![ActionType {
            r#type: STATUS_ACTION.to_string(),
            description: "Get the server status or, given a ticket, a job status".to_string(),
        }]
    }

    async fn handle(&self, action: &Action, producer: &Arc<Producer>, _identity: &str) -> Outcome {
        if action.body.is_empty() {
            let status = ServerStatus {
                name: "plexus",
                version: env!("CARGO_PKG_VERSION"),
                flights: producer.flight_count().await,
                jobs: producer.job_count().await,
                actions: producer
                    .action_descriptions()
                    .await
                    .into_iter()
                    .map(|a| a.r#type)
                    .collect(),
            };
            return match serde_json::to_vec(&status) {
                Ok(body) => Outcome::success(body),
                Err(e) => Outcome::failure(PlexusError::Internal(e.to_string())),
            };
        }

        if action.body.len() != TICKET_LENGTH {
            return Outcome::failure(PlexusError::InvalidArgument(
                "status body must be empty or a serialized ticket".into(),
            ));
        }
        match producer.job(&action.body).await {
            Some(job) => Outcome::success(job.core().status().to_string().into_bytes()),
            None => Outcome::failure(PlexusError::NotFound("no job for ticket".into())),
        }
    }
}
