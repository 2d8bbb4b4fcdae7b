//! Wire formats of the action bodies.
//!
//! Cypher messages use a length-prefixed binary framing; the GDS messages are
//! plain JSON.

use serde::{Deserialize, Serialize};

use crate::core::PlexusError;

pub const ENTITY_NODE: &str = "node";
pub const ENTITY_RELATIONSHIPS: &str = "relationships";

/// Body of a `cypherRead` action:
/// big-endian u16 length + cypher bytes, the same for the database name, the
/// same for the parameter JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct CypherMessage {
    pub cypher: String,
    pub database: String,
    pub params: serde_json::Value,
}

impl CypherMessage {
    pub fn new(cypher: impl Into<String>, database: impl Into<String>) -> CypherMessage {
        CypherMessage {
            cypher: cypher.into(),
            database: database.into(),
            params: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PlexusError> {
        let params = serde_json::to_vec(&self.params)
            .map_err(|e| PlexusError::Internal(format!("encoding cypher params: {e}")))?;
        let mut buffer = Vec::new();
        for segment in [self.cypher.as_bytes(), self.database.as_bytes(), &params] {
            let length = u16::try_from(segment.len()).map_err(|_| {
                PlexusError::InvalidArgument("cypher message segment exceeds 64 KiB".into())
            })?;
            buffer.extend_from_slice(&length.to_be_bytes());
            buffer.extend_from_slice(segment);
        }
        Ok(buffer)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<CypherMessage, PlexusError> {
        let mut position = 0;
        let cypher = read_segment(bytes, &mut position)?;
        let database = read_segment(bytes, &mut position)?;
        let params = read_segment(bytes, &mut position)?;
        Ok(CypherMessage {
            cypher: String::from_utf8(cypher.to_vec())
                .map_err(|e| PlexusError::InvalidArgument(format!("invalid cypher: {e}")))?,
            database: String::from_utf8(database.to_vec())
                .map_err(|e| PlexusError::InvalidArgument(format!("invalid database: {e}")))?,
            params: serde_json::from_slice(params)
                .map_err(|e| PlexusError::InvalidArgument(format!("invalid params: {e}")))?,
        })
    }
}

fn read_segment<'a>(bytes: &'a [u8], position: &mut usize) -> Result<&'a [u8], PlexusError> {
    let header_end = *position + 2;
    if bytes.len() < header_end {
        return Err(PlexusError::InvalidArgument(
            "truncated cypher message".into(),
        ));
    }
    let length = u16::from_be_bytes([bytes[*position], bytes[*position + 1]]) as usize;
    if bytes.len() < header_end + length {
        return Err(PlexusError::InvalidArgument(
            "truncated cypher message".into(),
        ));
    }
    *position = header_end + length;
    Ok(&bytes[header_end..header_end + length])
}

/// Body of the GDS read actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GdsMessage {
    #[serde(default = "default_db")]
    pub db: String,
    pub graph: String,
    #[serde(rename = "type", default = "default_entity")]
    pub entity: String,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
}

impl GdsMessage {
    pub fn deserialize(bytes: &[u8]) -> Result<GdsMessage, PlexusError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PlexusError::InvalidArgument(format!("invalid gds message: {e}")))
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PlexusError> {
        serde_json::to_vec(self)
            .map_err(|e| PlexusError::Internal(format!("encoding gds message: {e}")))
    }
}

/// Body of the `gds.write.nodes` action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GdsWriteNodeMessage {
    #[serde(default = "default_db")]
    pub db: String,
    pub graph: String,
    #[serde(rename = "idField", default = "default_id_field")]
    pub id_field: String,
    #[serde(rename = "labelsField", default = "default_labels_field")]
    pub labels_field: String,
}

impl GdsWriteNodeMessage {
    pub fn deserialize(bytes: &[u8]) -> Result<GdsWriteNodeMessage, PlexusError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PlexusError::InvalidArgument(format!("invalid gds write message: {e}")))
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PlexusError> {
        serde_json::to_vec(self)
            .map_err(|e| PlexusError::Internal(format!("encoding gds write message: {e}")))
    }
}

fn default_db() -> String {
    "neo4j".to_string()
}

fn default_entity() -> String {
    ENTITY_NODE.to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_labels_field() -> String {
    "labels".to_string()
}

/// What a job creator receives; one variant per action family.
#[derive(Debug, Clone)]
pub enum JobMessage {
    Cypher(CypherMessage),
    GdsRead(GdsMessage),
    GdsWriteNodes(GdsWriteNodeMessage),
}
