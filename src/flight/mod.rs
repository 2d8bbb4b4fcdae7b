mod error;
mod flush;
mod pool;
mod producer;

pub use producer::{Producer, TICKET_LENGTH};

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use arrow::ipc::writer::IpcWriteOptions;
use arrow::ipc::CompressionType;
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaAsIpc, SchemaResult, Ticket,
};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use log::{error, info};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::action::Outcome;
use crate::core::PlexusError;
use crate::job::{Job, JobStatus};
use crate::store::BatchStore;

/// Request header carrying the caller identity. Authentication itself is a
/// collaborator concern.
const IDENTITY_HEADER: &str = "x-remote-user";

pub struct PlexusFlightService {
    producer: Arc<Producer>,
}

impl PlexusFlightService {
    pub fn new(producer: Arc<Producer>) -> Self {
        Self { producer }
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    /// Serve until the process dies. Address resolution lives in
    /// [`crate::core::Config::socket_addr`].
    pub async fn serve(self, addr: SocketAddr) -> Result<(), PlexusError> {
        Server::builder()
            .add_service(FlightServiceServer::new(self))
            .serve(addr)
            .await
            .map_err(|e| PlexusError::IoError(format!("Flight server error: {e}")))
    }
}

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

fn peer_identity(metadata: &MetadataMap) -> String {
    metadata
        .get(IDENTITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

fn parse_ticket(bytes: &[u8]) -> Result<(), Status> {
    if bytes.len() != TICKET_LENGTH {
        return Err(Status::invalid_argument("failed to interpret ticket"));
    }
    Ok(())
}

#[tonic::async_trait]
impl FlightService for PlexusFlightService {
    type HandshakeStream = BoxStream<HandshakeResponse>;
    type ListFlightsStream = BoxStream<FlightInfo>;
    type DoGetStream = BoxStream<FlightData>;
    type DoPutStream = BoxStream<PutResult>;
    type DoExchangeStream = BoxStream<FlightData>;
    type DoActionStream = BoxStream<arrow_flight::Result>;
    type ListActionsStream = BoxStream<ActionType>;

    async fn do_get(
        &self,
        request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        let ticket = request.into_inner().ticket;
        let job = self
            .producer
            .job(&ticket)
            .await
            .ok_or_else(|| Status::not_found("no job for ticket"))?;
        let schema = self
            .producer
            .stream_schema(&ticket)
            .await
            .ok_or_else(|| Status::not_found("no flight for ticket"))?;
        let Job::Read(read) = job else {
            return Err(Status::invalid_argument("ticket does not name a read stream"));
        };

        // Capacity 1: at most one record batch in flight toward the encoder.
        let (out_tx, out_rx) = mpsc::channel(1);
        tokio::spawn(producer::run_read_stream(
            Arc::clone(&self.producer),
            ticket,
            read,
            Arc::clone(&schema),
            out_tx,
        ));

        let options = IpcWriteOptions::default()
            .try_with_compression(Some(CompressionType::LZ4_FRAME))
            .map_err(|e| Status::internal(e.to_string()))?;
        let stream = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .with_options(options)
            .build(
                ReceiverStream::new(out_rx)
                    .map(|result| result.map_err(|e| FlightError::Tonic(Status::from(e)))),
            )
            .map(|result| result.map_err(|e| e.into()));

        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        // Command descriptors carry a serialized ticket.
        let descriptor = request.into_inner();
        parse_ticket(&descriptor.cmd)?;
        let info = self
            .producer
            .flight_info(&descriptor.cmd)
            .await
            .ok_or_else(|| Status::not_found("no flight found"))?;
        Ok(Response::new(info))
    }

    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let descriptor = request.into_inner();
        parse_ticket(&descriptor.cmd)?;
        let schema = self
            .producer
            .stream_schema(&descriptor.cmd)
            .await
            .ok_or_else(|| Status::not_found("no flight found"))?;

        let options = IpcWriteOptions::default();
        let result = SchemaResult::try_from(SchemaAsIpc::new(schema.as_ref(), &options))
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(result))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        let infos = self.producer.list_flight_infos().await;
        Ok(Response::new(Box::pin(stream::iter(
            infos.into_iter().map(Ok),
        ))))
    }

    async fn do_put(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty put stream"))?;
        let descriptor = first
            .flight_descriptor
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing flight descriptor"))?;
        parse_ticket(&descriptor.cmd)?;
        let ticket = descriptor.cmd.clone();

        let job = self
            .producer
            .job(&ticket)
            .await
            .ok_or_else(|| Status::not_found("no job for ticket"))?;
        let Job::Write(write) = job else {
            return Err(Status::invalid_argument("ticket does not name a write stream"));
        };
        write.core().advance(JobStatus::Producing);

        let config = Arc::clone(self.producer.config());
        let data = stream::once(async move { Ok::<FlightData, FlightError>(first) })
            .chain(inbound.map_err(|status| FlightError::Tonic(status)));
        let mut decoder = FlightRecordBatchStream::new_from_flight_data(data);

        let mut store: Option<BatchStore> = None;
        loop {
            match decoder.try_next().await {
                Ok(Some(batch)) => {
                    let target = store.get_or_insert_with(|| {
                        BatchStore::new(
                            batch.schema(),
                            self.producer.allocator(),
                            "put",
                            config.max_stream_memory,
                        )
                    });
                    if let Err(err) = target.append_batch(&batch) {
                        write.core().fail();
                        return Err(Status::from(err));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    write.core().fail();
                    return Err(err.into());
                }
            }
        }

        let store = store
            .ok_or_else(|| Status::invalid_argument("put stream carried no record batches"))?;
        let rows = store.row_count();
        write.complete_stream(store).map_err(Status::from)?;
        info!("accepted put stream of {rows} rows");

        let ack = PutResult {
            app_metadata: Default::default(),
        };
        Ok(Response::new(Box::pin(stream::iter([Ok(ack)]))))
    }

    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let identity = peer_identity(request.metadata());
        let action = request.into_inner();
        info!("doAction called: type={}, peer={identity}", action.r#type);

        let handler = self
            .producer
            .handler(&action.r#type)
            .await
            .ok_or_else(|| Status::not_found(format!("unsupported action {}", action.r#type)))?;

        match handler.handle(&action, &self.producer, &identity).await {
            Outcome::Success(body) => {
                let result = arrow_flight::Result { body: body.into() };
                Ok(Response::new(Box::pin(stream::iter([Ok(result)]))))
            }
            Outcome::Failure(err) => {
                error!("action {} failed: {err}", action.r#type);
                Err(Status::from(err))
            }
        }
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let descriptions = self.producer.action_descriptions().await;
        Ok(Response::new(Box::pin(stream::iter(
            descriptions.into_iter().map(Ok),
        ))))
    }

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("handshake not supported"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info not supported"))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("do_exchange not supported"))
    }
}
