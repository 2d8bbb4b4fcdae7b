//! In-memory graph catalog and the job creator that serves GDS actions from
//! it. The catalog plays the collaborator role an external graph engine
//! would fill behind the same [`JobCreator`] seam.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::RwLock;

use crate::action::message::{
    GdsMessage, GdsWriteNodeMessage, JobMessage, ENTITY_NODE, ENTITY_RELATIONSHIPS,
};
use crate::core::{Config, PlexusError};
use crate::job::{Job, JobCreator, JobStatus, Mode, ReadBinding, ReadJob, WriteJob};
use crate::record::{Value, ValueRow};
use crate::store::BatchStore;

/// One property across all nodes (or relationships) of a graph.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyColumn {
    Long(Vec<i64>),
    Double(Vec<f64>),
    Text(Vec<String>),
    LongArray(Vec<Vec<i64>>),
    FloatArray(Vec<Vec<f32>>),
    DoubleArray(Vec<Vec<f64>>),
}

impl PropertyColumn {
    pub fn len(&self) -> usize {
        match self {
            PropertyColumn::Long(v) => v.len(),
            PropertyColumn::Double(v) => v.len(),
            PropertyColumn::Text(v) => v.len(),
            PropertyColumn::LongArray(v) => v.len(),
            PropertyColumn::FloatArray(v) => v.len(),
            PropertyColumn::DoubleArray(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Option<Value> {
        match self {
            PropertyColumn::Long(v) => v.get(index).map(|x| Value::Int64(*x)),
            PropertyColumn::Double(v) => v.get(index).map(|x| Value::Float64(*x)),
            PropertyColumn::Text(v) => v.get(index).map(|x| Value::Utf8(x.clone())),
            PropertyColumn::LongArray(v) => v.get(index).map(|x| Value::LongArray(x.clone())),
            PropertyColumn::FloatArray(v) => v.get(index).map(|x| Value::FloatArray(x.clone())),
            PropertyColumn::DoubleArray(v) => v.get(index).map(|x| Value::DoubleArray(x.clone())),
        }
    }

    fn extend_from(&mut self, other: PropertyColumn) -> Result<(), PlexusError> {
        match (self, other) {
            (PropertyColumn::Long(a), PropertyColumn::Long(b)) => a.extend(b),
            (PropertyColumn::Double(a), PropertyColumn::Double(b)) => a.extend(b),
            (PropertyColumn::Text(a), PropertyColumn::Text(b)) => a.extend(b),
            (PropertyColumn::LongArray(a), PropertyColumn::LongArray(b)) => a.extend(b),
            (PropertyColumn::FloatArray(a), PropertyColumn::FloatArray(b)) => a.extend(b),
            (PropertyColumn::DoubleArray(a), PropertyColumn::DoubleArray(b)) => a.extend(b),
            _ => {
                return Err(PlexusError::TypeMismatch(
                    "property column types disagree".into(),
                ))
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub source: i64,
    pub target: i64,
    pub rel_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct NamedGraph {
    pub node_ids: Vec<i64>,
    pub labels: Vec<Vec<String>>,
    pub node_properties: BTreeMap<String, PropertyColumn>,
    pub relationships: Vec<Relationship>,
    pub rel_properties: BTreeMap<String, PropertyColumn>,
}

impl NamedGraph {
    pub fn node_count(&self) -> usize {
        self.node_ids.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }
}

/// Registry of named graph projections.
pub struct GraphCatalog {
    graphs: RwLock<HashMap<String, Arc<NamedGraph>>>,
}

impl GraphCatalog {
    pub fn new() -> Arc<GraphCatalog> {
        Arc::new(GraphCatalog {
            graphs: RwLock::new(HashMap::new()),
        })
    }

    pub async fn put(&self, name: impl Into<String>, graph: NamedGraph) {
        self.graphs.write().await.insert(name.into(), Arc::new(graph));
    }

    pub async fn get(&self, name: &str) -> Option<Arc<NamedGraph>> {
        self.graphs.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.graphs.read().await.keys().cloned().collect()
    }

    /// Best-effort node append: creates the graph when absent, otherwise
    /// extends it. Property keys of an existing graph must line up.
    pub async fn merge_nodes(
        &self,
        name: &str,
        node_ids: Vec<i64>,
        labels: Vec<Vec<String>>,
        properties: BTreeMap<String, PropertyColumn>,
    ) -> Result<usize, PlexusError> {
        let count = node_ids.len();
        let mut graphs = self.graphs.write().await;
        match graphs.get(name) {
            None => {
                graphs.insert(
                    name.to_string(),
                    Arc::new(NamedGraph {
                        node_ids,
                        labels,
                        node_properties: properties,
                        ..Default::default()
                    }),
                );
            }
            Some(existing) => {
                let mut merged = NamedGraph::clone(existing);
                for (key, column) in properties {
                    match merged.node_properties.get_mut(&key) {
                        Some(target) => target.extend_from(column)?,
                        None => {
                            return Err(PlexusError::InvalidArgument(format!(
                                "property '{key}' not present in graph '{name}'"
                            )))
                        }
                    }
                }
                merged.node_ids.extend(node_ids);
                merged.labels.extend(labels);
                graphs.insert(name.to_string(), Arc::new(merged));
            }
        }
        Ok(count)
    }
}

enum Entity {
    Nodes,
    Relationships,
}

/// Field layout of one read stream over a graph.
struct ReadPlan {
    entity: Entity,
    keys: Arc<Vec<String>>,
    properties: Vec<String>,
}

impl ReadPlan {
    fn nodes(graph: &NamedGraph, message: &GdsMessage) -> Result<ReadPlan, PlexusError> {
        let properties = resolve_properties(&graph.node_properties, &message.properties)?;
        let mut keys = vec!["nodeId".to_string()];
        keys.extend(properties.iter().cloned());
        Ok(ReadPlan {
            entity: Entity::Nodes,
            keys: Arc::new(keys),
            properties,
        })
    }

    fn relationships(graph: &NamedGraph, message: &GdsMessage) -> Result<ReadPlan, PlexusError> {
        let properties = resolve_properties(&graph.rel_properties, &message.properties)?;
        let mut keys = vec![
            "sourceId".to_string(),
            "targetId".to_string(),
            "type".to_string(),
        ];
        keys.extend(properties.iter().cloned());
        Ok(ReadPlan {
            entity: Entity::Relationships,
            keys: Arc::new(keys),
            properties,
        })
    }

    fn row_count(&self, graph: &NamedGraph) -> usize {
        match self.entity {
            Entity::Nodes => graph.node_count(),
            Entity::Relationships => graph.relationship_count(),
        }
    }

    fn row(&self, graph: &NamedGraph, index: usize) -> ValueRow {
        let mut values = Vec::with_capacity(self.keys.len());
        let columns = match self.entity {
            Entity::Nodes => {
                values.push(Value::Int64(graph.node_ids[index]));
                &graph.node_properties
            }
            Entity::Relationships => {
                let relationship = &graph.relationships[index];
                values.push(Value::Int64(relationship.source));
                values.push(Value::Int64(relationship.target));
                values.push(Value::Utf8(relationship.rel_type.clone()));
                &graph.rel_properties
            }
        };
        for property in &self.properties {
            let value = columns
                .get(property)
                .and_then(|column| column.get(index))
                .unwrap_or(Value::Null);
            values.push(value);
        }
        ValueRow::new(Arc::clone(&self.keys), values)
    }
}

fn resolve_properties(
    available: &BTreeMap<String, PropertyColumn>,
    requested: &[String],
) -> Result<Vec<String>, PlexusError> {
    if requested.is_empty() {
        return Ok(available.keys().cloned().collect());
    }
    for property in requested {
        if !available.contains_key(property) {
            return Err(PlexusError::InvalidArgument(format!(
                "property '{property}' not present in graph"
            )));
        }
    }
    Ok(requested.to_vec())
}

/// Serves GDS read and write jobs from the catalog. Cypher needs an external
/// driver and is rejected here.
pub struct CatalogJobCreator {
    catalog: Arc<GraphCatalog>,
    config: Arc<Config>,
}

impl CatalogJobCreator {
    pub fn new(catalog: Arc<GraphCatalog>, config: Arc<Config>) -> Arc<CatalogJobCreator> {
        Arc::new(CatalogJobCreator { catalog, config })
    }

    async fn new_read_job(&self, message: GdsMessage) -> Result<Job, PlexusError> {
        let graph = self.catalog.get(&message.graph).await.ok_or_else(|| {
            PlexusError::NotFound(format!("graph '{}' not in catalog", message.graph))
        })?;
        let plan = match message.entity.as_str() {
            ENTITY_NODE => ReadPlan::nodes(&graph, &message)?,
            ENTITY_RELATIONSHIPS => ReadPlan::relationships(&graph, &message)?,
            other => {
                return Err(PlexusError::InvalidArgument(format!(
                    "unknown entity type '{other}'"
                )))
            }
        };

        let (job, binding) = ReadJob::create();
        let lanes = self.config.max_partitions.max(1);
        tokio::spawn(feed_rows(graph, plan, binding, lanes));
        Ok(Job::Read(job))
    }

    fn new_write_job(&self, message: GdsWriteNodeMessage) -> Job {
        let (job, binding) = WriteJob::create();
        let catalog = Arc::clone(&self.catalog);
        tokio::spawn(async move {
            let core = binding.core();
            core.advance(JobStatus::Pending);
            let store = match binding.stream_completion().await {
                Ok(store) => store,
                Err(err) => {
                    error!("write job never received its stream: {err}");
                    core.fail();
                    return;
                }
            };
            match apply_node_writes(&catalog, &message, store).await {
                Ok(count) => {
                    info!("wrote {count} nodes into graph '{}'", message.graph);
                    core.complete();
                }
                Err(err) => {
                    error!("node write failed: {err}");
                    core.fail();
                }
            }
        });
        Job::Write(job)
    }
}

#[async_trait]
impl JobCreator for CatalogJobCreator {
    async fn new_job(
        &self,
        message: JobMessage,
        mode: Mode,
        _identity: &str,
    ) -> Result<Job, PlexusError> {
        match (message, mode) {
            (JobMessage::Cypher(_), _) => Err(PlexusError::InvalidArgument(
                "no cypher executor configured; cypherRead needs an external driver".into(),
            )),
            (JobMessage::GdsRead(message), Mode::Read) => self.new_read_job(message).await,
            (JobMessage::GdsWriteNodes(message), Mode::Write) => {
                Ok(self.new_write_job(message))
            }
            _ => Err(PlexusError::InvalidArgument(
                "message does not match job mode".into(),
            )),
        }
    }
}

/// Feed every row of the plan into the installed consumer, one feeder task
/// per partition lane so per-partition arrival order follows the row index.
async fn feed_rows(
    graph: Arc<NamedGraph>,
    plan: ReadPlan,
    mut binding: ReadBinding,
    lanes: usize,
) {
    let core = binding.core();
    core.advance(JobStatus::Pending);
    let total = plan.row_count(&graph);
    if total == 0 {
        // No first record, so no schema; dropping the binding tears the
        // pending flight down.
        binding.complete();
        return;
    }
    binding.offer_first(Box::new(plan.row(&graph, 0)));

    let Some(consumer) = binding.consumer().await else {
        return;
    };

    let plan = Arc::new(plan);
    let mut workers = Vec::with_capacity(lanes);
    for lane in 0..lanes {
        let graph = Arc::clone(&graph);
        let plan = Arc::clone(&plan);
        let consumer = Arc::clone(&consumer);
        let core = binding.core();
        workers.push(tokio::spawn(async move {
            let mut index = lane;
            while index < total {
                if core.is_terminal() {
                    return;
                }
                let row = plan.row(&graph, index);
                if consumer.accept(Box::new(row), index as u64).await.is_err() {
                    return;
                }
                index += lanes;
            }
        }));
    }
    for worker in workers {
        let _ = worker.await;
    }
    binding.complete();
}

async fn apply_node_writes(
    catalog: &GraphCatalog,
    message: &GdsWriteNodeMessage,
    mut store: BatchStore,
) -> Result<usize, PlexusError> {
    let built = build_nodes(&store, message);
    let merged = match built {
        Ok((ids, labels, properties)) => {
            catalog
                .merge_nodes(&message.graph, ids, labels, properties)
                .await
        }
        Err(err) => Err(err),
    };
    let closed = store.close();
    let count = merged?;
    closed?;
    Ok(count)
}

type BuiltNodes = (Vec<i64>, Vec<Vec<String>>, BTreeMap<String, PropertyColumn>);

fn build_nodes(
    store: &BatchStore,
    message: &GdsWriteNodeMessage,
) -> Result<BuiltNodes, PlexusError> {
    let id_index = store.field_index(&message.id_field).ok_or_else(|| {
        PlexusError::InvalidArgument(format!(
            "id field '{}' not present in stream",
            message.id_field
        ))
    })?;
    let labels_index = store.field_index(&message.labels_field).ok_or_else(|| {
        PlexusError::InvalidArgument(format!(
            "labels field '{}' not present in stream",
            message.labels_field
        ))
    })?;

    let schema = Arc::clone(store.schema());
    let mut ids = Vec::with_capacity(store.row_count());
    let mut labels = Vec::with_capacity(store.row_count());
    let mut properties: BTreeMap<String, PropertyColumn> = BTreeMap::new();
    for row in 0..store.row_count() {
        ids.push(store.get_i64(id_index, row)?);
        labels.push(store.get_string_list(labels_index, row)?);
        for (index, field) in schema.fields().iter().enumerate() {
            if index == id_index || index == labels_index {
                continue;
            }
            let value = store.get_by_index(index, row)?;
            append_property(&mut properties, field.name(), value)?;
        }
    }
    Ok((ids, labels, properties))
}

fn append_property(
    properties: &mut BTreeMap<String, PropertyColumn>,
    name: &str,
    value: Value,
) -> Result<(), PlexusError> {
    let incoming = match value {
        Value::Int32(v) => PropertyColumn::Long(vec![v as i64]),
        Value::Int64(v) => PropertyColumn::Long(vec![v]),
        Value::Float32(v) => PropertyColumn::Double(vec![v as f64]),
        Value::Float64(v) => PropertyColumn::Double(vec![v]),
        Value::Utf8(v) => PropertyColumn::Text(vec![v]),
        Value::IntArray(v) => {
            PropertyColumn::LongArray(vec![v.into_iter().map(i64::from).collect()])
        }
        Value::LongArray(v) => PropertyColumn::LongArray(vec![v]),
        Value::FloatArray(v) => PropertyColumn::FloatArray(vec![v]),
        Value::DoubleArray(v) => PropertyColumn::DoubleArray(vec![v]),
        list @ Value::List(_) => PropertyColumn::DoubleArray(vec![list.as_f64_list()?]),
        other => {
            return Err(PlexusError::InvalidArgument(format!(
                "unsupported property value {} for '{name}'",
                crate::record::type_name(&other)
            )))
        }
    };
    match properties.get_mut(name) {
        Some(column) => column.extend_from(incoming),
        None => {
            properties.insert(name.to_string(), incoming);
            Ok(())
        }
    }
}
