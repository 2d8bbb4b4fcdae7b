use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::core::PlexusError;

/// Process-wide configuration, read once from the environment at startup.
///
/// All numeric values are coerced to their absolute value; the credentials
/// live in cleartext in the process environment, so buyer beware.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Bolt URL of the upstream graph database (collaborator).
    pub neo4j_url: String,
    pub username: String,
    pub password: String,
    pub database: String,

    /// Hostname or IP address to listen on.
    pub host: String,
    /// Port number to listen on.
    pub port: u16,

    /// Maximum native memory allowed for the root allocator and its children.
    pub max_global_memory: u64,
    /// Maximum native memory allowed for a single stream.
    pub max_stream_memory: u64,
    /// Number of rows per transmitted record batch.
    pub batch_size: usize,
    /// How many records the upstream driver pulls at a time. Should be set
    /// lower than the batch size.
    pub fetch_size: usize,
    /// Number of partition lanes used to stage rows before batching.
    pub max_partitions: usize,
    /// Bound on the final flush-pipeline drain at stream end.
    pub flush_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Config, PlexusError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. `from_env` feeds the
    /// process environment through here; tests feed maps.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, PlexusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            neo4j_url: string_var(&lookup, "NEO4J_URL", "neo4j://localhost:7687"),
            username: string_var(&lookup, "NEO4J_USERNAME", "neo4j"),
            password: string_var(&lookup, "NEO4J_PASSWORD", "password"),
            database: string_var(&lookup, "NEO4J_DATABASE", "neo4j"),
            host: string_var(&lookup, "HOST", Self::default_host()),
            port: numeric_var(&lookup, "PORT", Self::default_port() as u64)? as u16,
            max_global_memory: numeric_var(&lookup, "MAX_MEM_GLOBAL", u64::MAX)?,
            max_stream_memory: numeric_var(&lookup, "MAX_MEM_STREAM", i32::MAX as u64)?,
            batch_size: numeric_var(&lookup, "ARROW_BATCH_SIZE", 25_000)? as usize,
            fetch_size: numeric_var(&lookup, "BOLT_FETCH_SIZE", 1_000)? as usize,
            max_partitions: numeric_var(&lookup, "ARROW_MAX_PARTITIONS", Self::default_partitions() as u64)?
                as usize,
            flush_timeout: Duration::from_secs(numeric_var(&lookup, "ARROW_FLUSH_TIMEOUT", 300)?),
        })
    }

    fn default_host() -> &'static str {
        "localhost"
    }

    fn default_port() -> u16 {
        9999
    }

    fn default_partitions() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the listen address. `HOST` may be a hostname, so this goes
    /// through the resolver rather than a plain parse.
    pub fn socket_addr(&self) -> Result<SocketAddr, PlexusError> {
        let addr = self.addr();
        addr.to_socket_addrs()
            .map_err(|e| PlexusError::ConfigError(format!("invalid listen address {addr}: {e}")))?
            .next()
            .ok_or_else(|| {
                PlexusError::ConfigError(format!("listen address {addr} did not resolve"))
            })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_lookup(|_| None).expect("defaults are parseable")
    }
}

fn string_var<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).unwrap_or_else(|| default.to_string())
}

/// Parse a numeric environment value, coercing negatives to their absolute
/// value.
fn numeric_var<F>(lookup: &F, key: &str, default: u64) -> Result<u64, PlexusError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(|v| v.unsigned_abs())
            .map_err(|e| PlexusError::ConfigError(format!("{key}={raw}: {e}"))),
    }
}
