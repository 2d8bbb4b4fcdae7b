mod args;
mod config;
mod error;
mod logger;

pub use args::CliArgs;
pub use config::Config;
pub use error::PlexusError;
pub use logger::setup_logging;
