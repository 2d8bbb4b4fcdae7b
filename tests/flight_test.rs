use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, FixedSizeListArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::flight_service_server::FlightServiceServer;
use arrow_flight::{Action, Criteria, Empty, FlightData, FlightDescriptor, Ticket};
use futures::{stream, StreamExt, TryStreamExt};
use tonic::transport::{Channel, Server};

use plexus::action::{CypherActionHandler, GdsActionHandler};
use plexus::catalog::{
    CatalogJobCreator, GraphCatalog, NamedGraph, PropertyColumn, Relationship,
};
use plexus::core::Config;
use plexus::flight::{PlexusFlightService, Producer};
use plexus::memory::Allocator;

/// Guard that shuts down the Flight server when dropped.
struct ServerGuard {
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

struct TestHarness {
    _guard: ServerGuard,
    client: FlightServiceClient<Channel>,
    catalog: Arc<GraphCatalog>,
}

async fn setup_with(config: Config) -> TestHarness {
    let config = Arc::new(config);
    let root = Allocator::root("test-root", config.max_global_memory);
    let producer = Producer::new(&root, Arc::clone(&config));
    let catalog = GraphCatalog::new();
    let creator = CatalogJobCreator::new(Arc::clone(&catalog), Arc::clone(&config));
    producer
        .register_handler(Arc::new(CypherActionHandler::new(creator.clone())))
        .await;
    producer
        .register_handler(Arc::new(GdsActionHandler::new(creator)))
        .await;

    let service = PlexusFlightService::new(producer);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        Server::builder()
            .add_service(FlightServiceServer::new(service))
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::TcpListenerStream::new(listener),
                async {
                    let _ = shutdown_rx.await;
                },
            )
            .await
            .unwrap();
    });

    let channel = Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();

    TestHarness {
        _guard: ServerGuard {
            _shutdown: shutdown_tx,
        },
        client: FlightServiceClient::new(channel),
        catalog,
    }
}

fn small_config(batch_size: usize, max_partitions: usize) -> Config {
    Config {
        batch_size,
        max_partitions,
        ..Config::default()
    }
}

fn nodes_graph(count: usize) -> NamedGraph {
    NamedGraph {
        node_ids: (0..count as i64).collect(),
        labels: (0..count).map(|_| vec!["Node".to_string()]).collect(),
        node_properties: BTreeMap::from([(
            "age".to_string(),
            PropertyColumn::Long((0..count as i64).map(|i| 20 + i).collect()),
        )]),
        ..Default::default()
    }
}

async fn do_action(
    client: &mut FlightServiceClient<Channel>,
    action_type: &str,
    body: Vec<u8>,
) -> Result<Vec<u8>, tonic::Status> {
    let mut results = client
        .do_action(Action {
            r#type: action_type.to_string(),
            body: body.into(),
        })
        .await?
        .into_inner();
    let result = results.message().await?.expect("action yields one result");
    Ok(result.body.to_vec())
}

async fn start_node_read(
    client: &mut FlightServiceClient<Channel>,
    graph: &str,
) -> Vec<u8> {
    let body = serde_json::json!({"graph": graph, "type": "node"});
    do_action(
        client,
        "gdsNodeProperties",
        serde_json::to_vec(&body).unwrap(),
    )
    .await
    .unwrap()
}

/// The schema publication is asynchronous (it waits for the first record),
/// so poll until the flight appears.
async fn wait_for_flight(
    client: &mut FlightServiceClient<Channel>,
    ticket: &[u8],
) -> arrow_flight::FlightInfo {
    for _ in 0..500 {
        match client
            .get_flight_info(FlightDescriptor::new_cmd(ticket.to_vec()))
            .await
        {
            Ok(response) => return response.into_inner(),
            Err(status) if status.code() == tonic::Code::NotFound => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(status) => panic!("unexpected status waiting for flight: {status}"),
        }
    }
    panic!("flight never published");
}

async fn job_status(client: &mut FlightServiceClient<Channel>, ticket: &[u8]) -> String {
    let body = do_action(client, "status", ticket.to_vec()).await.unwrap();
    String::from_utf8(body).unwrap()
}

async fn wait_for_status(
    client: &mut FlightServiceClient<Channel>,
    ticket: &[u8],
    expected: &str,
) {
    for _ in 0..500 {
        if job_status(client, ticket).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached status {expected}");
}

async fn read_stream(
    client: &mut FlightServiceClient<Channel>,
    ticket: &[u8],
) -> Result<Vec<RecordBatch>, FlightError> {
    let response = client
        .do_get(Ticket::new(ticket.to_vec()))
        .await
        .map_err(|e| FlightError::Tonic(e))?;
    FlightRecordBatchStream::new_from_flight_data(
        response
            .into_inner()
            .map_err(|e| FlightError::Tonic(e)),
    )
    .try_collect()
    .await
}

fn int_column(batch: &RecordBatch, index: usize) -> Vec<i64> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap()
        .iter()
        .flatten()
        .collect()
}

#[tokio::test]
async fn test_small_node_read_round_trip() {
    let mut harness = setup_with(small_config(100, 2)).await;
    harness.catalog.put("g", nodes_graph(3)).await;

    let ticket = start_node_read(&mut harness.client, "g").await;
    let info = wait_for_flight(&mut harness.client, &ticket).await;

    let schema = Schema::try_from(info).unwrap();
    let field_names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(field_names, vec!["nodeId", "age"]);
    assert_eq!(schema.field(0).data_type(), &DataType::Int64);

    let batches = read_stream(&mut harness.client, &ticket).await.unwrap();
    let mut rows: Vec<(i64, i64)> = Vec::new();
    for batch in &batches {
        let ids = int_column(batch, 0);
        let ages = int_column(batch, 1);
        rows.extend(ids.into_iter().zip(ages));
    }
    rows.sort();
    assert_eq!(rows, vec![(0, 20), (1, 21), (2, 22)]);

    wait_for_status(&mut harness.client, &ticket, "COMPLETE").await;
}

#[tokio::test]
async fn test_exact_batch_boundary() {
    // B=2, one partition, 4 rows: exactly two batches of two, in order.
    let mut harness = setup_with(small_config(2, 1)).await;
    harness.catalog.put("g", nodes_graph(4)).await;

    let ticket = start_node_read(&mut harness.client, "g").await;
    wait_for_flight(&mut harness.client, &ticket).await;
    let batches = read_stream(&mut harness.client, &ticket).await.unwrap();

    assert_eq!(batches.len(), 2);
    assert_eq!(int_column(&batches[0], 0), vec![0, 1]);
    assert_eq!(int_column(&batches[1], 0), vec![2, 3]);
}

#[tokio::test]
async fn test_partitioned_interleave() {
    // 5 rows across 2 partitions with B=2: every batch holds rows of a
    // single partition, nothing exceeds 2 rows, and all 5 arrive.
    let mut harness = setup_with(small_config(2, 2)).await;
    harness.catalog.put("g", nodes_graph(5)).await;

    let ticket = start_node_read(&mut harness.client, "g").await;
    wait_for_flight(&mut harness.client, &ticket).await;
    let batches = read_stream(&mut harness.client, &ticket).await.unwrap();

    assert!(batches.len() >= 2);
    let mut all_ids = Vec::new();
    for batch in &batches {
        assert!(batch.num_rows() <= 2);
        let ids = int_column(batch, 0);
        let parity = ids[0] % 2;
        assert!(ids.iter().all(|id| id % 2 == parity));
        all_ids.extend(ids);
    }
    all_ids.sort();
    assert_eq!(all_ids, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_fixed_size_list_column() {
    let mut harness = setup_with(small_config(10, 1)).await;
    let graph = NamedGraph {
        node_ids: vec![1],
        labels: vec![vec![]],
        node_properties: BTreeMap::from([(
            "vec".to_string(),
            PropertyColumn::DoubleArray(vec![vec![1.0, 2.0, 3.0]]),
        )]),
        ..Default::default()
    };
    harness.catalog.put("g", graph).await;

    let ticket = start_node_read(&mut harness.client, "g").await;
    let info = wait_for_flight(&mut harness.client, &ticket).await;
    let schema = Schema::try_from(info).unwrap();
    match schema.field(1).data_type() {
        DataType::FixedSizeList(child, stride) => {
            assert_eq!(*stride, 3);
            assert_eq!(child.data_type(), &DataType::Float64);
        }
        other => panic!("expected fixed-size list, got {other}"),
    }

    let batches = read_stream(&mut harness.client, &ticket).await.unwrap();
    assert_eq!(batches.len(), 1);
    let lists = batches[0]
        .column(1)
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .unwrap();
    assert_eq!(lists.value_length(), 3);
    let values = lists.value(0);
    let floats = values.as_any().downcast_ref::<Float64Array>().unwrap();
    assert_eq!(floats.value(0), 1.0);
    assert_eq!(floats.value(2), 3.0);
}

#[tokio::test]
async fn test_ragged_array_fails_the_stream() {
    // The first row fixes the stride at 3; the second row has 2 elements and
    // must fail the whole stream with InvalidArgument.
    let mut harness = setup_with(small_config(10, 1)).await;
    let graph = NamedGraph {
        node_ids: vec![1, 2],
        labels: vec![vec![], vec![]],
        node_properties: BTreeMap::from([(
            "vec".to_string(),
            PropertyColumn::DoubleArray(vec![vec![1.0, 2.0, 3.0], vec![1.0, 2.0]]),
        )]),
        ..Default::default()
    };
    harness.catalog.put("g", graph).await;

    let ticket = start_node_read(&mut harness.client, "g").await;
    wait_for_flight(&mut harness.client, &ticket).await;

    let result = read_stream(&mut harness.client, &ticket).await;
    match result {
        Err(FlightError::Tonic(status)) => {
            assert_eq!(status.code(), tonic::Code::InvalidArgument)
        }
        other => panic!("expected tonic error, got {other:?}"),
    }
    wait_for_status(&mut harness.client, &ticket, "CANCELLED").await;
}

#[tokio::test]
async fn test_cancellation_mid_stream() {
    // B=1 and a capacity-1 transmit window: the producer stalls quickly, the
    // client walks away after one batch, and the job must observe the
    // cancellation.
    let mut harness = setup_with(small_config(1, 1)).await;
    harness.catalog.put("g", nodes_graph(200)).await;

    let ticket = start_node_read(&mut harness.client, "g").await;
    wait_for_flight(&mut harness.client, &ticket).await;

    let response = harness
        .client
        .do_get(Ticket::new(ticket.clone()))
        .await
        .unwrap();
    let mut stream = FlightRecordBatchStream::new_from_flight_data(
        response
            .into_inner()
            .map_err(|e| FlightError::Tonic(e)),
    );
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.num_rows(), 1);
    drop(stream);

    wait_for_status(&mut harness.client, &ticket, "CANCELLED").await;
}

#[tokio::test]
async fn test_relationship_read() {
    let mut harness = setup_with(small_config(10, 1)).await;
    let graph = NamedGraph {
        node_ids: vec![1, 2],
        labels: vec![vec![], vec![]],
        relationships: vec![
            Relationship {
                source: 1,
                target: 2,
                rel_type: "KNOWS".to_string(),
            },
            Relationship {
                source: 2,
                target: 1,
                rel_type: "KNOWS".to_string(),
            },
        ],
        rel_properties: BTreeMap::from([(
            "weight".to_string(),
            PropertyColumn::Double(vec![0.25, 0.75]),
        )]),
        ..Default::default()
    };
    harness.catalog.put("g", graph).await;

    let body = serde_json::json!({"graph": "g", "type": "relationships"});
    let ticket = do_action(
        &mut harness.client,
        "gdsRelProperties",
        serde_json::to_vec(&body).unwrap(),
    )
    .await
    .unwrap();
    wait_for_flight(&mut harness.client, &ticket).await;

    let batches = read_stream(&mut harness.client, &ticket).await.unwrap();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.num_rows(), 2);
    assert_eq!(int_column(batch, 0), vec![1, 2]);
    assert_eq!(int_column(batch, 1), vec![2, 1]);
    let types = batch
        .column(2)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    assert_eq!(types.value(0), "KNOWS");
    let weights = batch
        .column(3)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    assert_eq!(weights.value(1), 0.75);
}

fn write_batch(schema: Arc<Schema>, ids: &[i64]) -> RecordBatch {
    let id_array: Int64Array = ids.iter().copied().map(Some).collect();
    let mut label_builder =
        arrow::array::ListBuilder::new(arrow::array::StringBuilder::new());
    for _ in ids {
        label_builder.values().append_value("Person");
        label_builder.append(true);
    }
    let scores: Float64Array = ids.iter().map(|id| Some(*id as f64 * 10.0)).collect();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(id_array),
            Arc::new(label_builder.finish()),
            Arc::new(scores),
        ],
    )
    .unwrap()
}

#[tokio::test]
async fn test_write_nodes_round_trip() {
    let mut harness = setup_with(small_config(10, 2)).await;

    let body = serde_json::json!({"graph": "written", "idField": "id", "labelsField": "labels"});
    let ticket = do_action(
        &mut harness.client,
        "gds.write.nodes",
        serde_json::to_vec(&body).unwrap(),
    )
    .await
    .unwrap();

    let schema = Arc::new(Schema::new(vec![
        arrow::datatypes::Field::new("id", DataType::Int64, true),
        arrow::datatypes::Field::new(
            "labels",
            DataType::List(Arc::new(arrow::datatypes::Field::new(
                "item",
                DataType::Utf8,
                true,
            ))),
            true,
        ),
        arrow::datatypes::Field::new("score", DataType::Float64, true),
    ]));
    let batches = vec![
        write_batch(Arc::clone(&schema), &[1, 2]),
        write_batch(Arc::clone(&schema), &[3, 4]),
    ];

    let flight_data: Vec<FlightData> = FlightDataEncoderBuilder::new()
        .with_flight_descriptor(Some(FlightDescriptor::new_cmd(ticket.clone())))
        .build(stream::iter(batches.into_iter().map(Ok)))
        .try_collect()
        .await
        .unwrap();

    let mut acks = harness
        .client
        .do_put(stream::iter(flight_data))
        .await
        .unwrap()
        .into_inner();
    while acks.message().await.unwrap().is_some() {}

    wait_for_status(&mut harness.client, &ticket, "COMPLETE").await;

    let graph = harness.catalog.get("written").await.unwrap();
    assert_eq!(graph.node_ids, vec![1, 2, 3, 4]);
    assert_eq!(graph.labels[0], vec!["Person".to_string()]);
    assert_eq!(
        graph.node_properties.get("score"),
        Some(&PropertyColumn::Double(vec![10.0, 20.0, 30.0, 40.0]))
    );

    // The written graph is immediately readable.
    let ticket = start_node_read(&mut harness.client, "written").await;
    wait_for_flight(&mut harness.client, &ticket).await;
    let batches = read_stream(&mut harness.client, &ticket).await.unwrap();
    let total: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total, 4);
}

#[tokio::test]
async fn test_status_blob() {
    let mut harness = setup_with(small_config(10, 1)).await;
    let body = do_action(&mut harness.client, "status", Vec::new())
        .await
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["name"], "plexus");
    assert!(status["actions"]
        .as_array()
        .unwrap()
        .iter()
        .any(|a| a == "gdsNodeProperties"));
}

#[tokio::test]
async fn test_list_actions() {
    let mut harness = setup_with(small_config(10, 1)).await;
    let response = harness.client.list_actions(Empty {}).await.unwrap();
    let actions: Vec<String> = response
        .into_inner()
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.r#type)
        .collect();
    for expected in [
        "status",
        "cypherRead",
        "gdsNodeProperties",
        "gdsRelProperties",
        "gds.write.nodes",
    ] {
        assert!(actions.contains(&expected.to_string()), "missing {expected}");
    }
}

#[tokio::test]
async fn test_list_flights_shows_published_streams() {
    let mut harness = setup_with(small_config(10, 1)).await;
    harness.catalog.put("g", nodes_graph(2)).await;

    let ticket = start_node_read(&mut harness.client, "g").await;
    wait_for_flight(&mut harness.client, &ticket).await;

    let response = harness
        .client
        .list_flights(Criteria::default())
        .await
        .unwrap();
    let infos: Vec<arrow_flight::FlightInfo> =
        response.into_inner().try_collect().await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].flight_descriptor.as_ref().unwrap().cmd, ticket);
}

#[tokio::test]
async fn test_unknown_action_not_found() {
    let mut harness = setup_with(small_config(10, 1)).await;
    let err = do_action(&mut harness.client, "nope", Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn test_cypher_without_driver_is_invalid_argument() {
    let mut harness = setup_with(small_config(10, 1)).await;
    let message = plexus::action::message::CypherMessage::new("MATCH (n) RETURN n", "neo4j");
    let err = do_action(
        &mut harness.client,
        "cypherRead",
        message.serialize().unwrap(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_do_get_unknown_ticket() {
    let mut harness = setup_with(small_config(10, 1)).await;
    let err = harness
        .client
        .do_get(Ticket::new(vec![7u8; 16]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn test_get_flight_info_malformed_ticket() {
    let mut harness = setup_with(small_config(10, 1)).await;
    let err = harness
        .client
        .get_flight_info(FlightDescriptor::new_cmd(vec![1, 2, 3]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_get_schema_after_publication() {
    let mut harness = setup_with(small_config(10, 1)).await;
    harness.catalog.put("g", nodes_graph(1)).await;

    let ticket = start_node_read(&mut harness.client, "g").await;
    wait_for_flight(&mut harness.client, &ticket).await;

    let result = harness
        .client
        .get_schema(FlightDescriptor::new_cmd(ticket))
        .await
        .unwrap()
        .into_inner();
    let schema = Schema::try_from(&result).unwrap();
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["nodeId", "age"]);
}
