use std::sync::Arc;

use clap::Parser;
use log::info;

use plexus::action::{CypherActionHandler, GdsActionHandler};
use plexus::catalog::{CatalogJobCreator, GraphCatalog};
use plexus::core::{setup_logging, CliArgs, Config, PlexusError};
use plexus::flight::{PlexusFlightService, Producer};
use plexus::memory::Allocator;

#[tokio::main]
async fn main() -> Result<(), PlexusError> {
    setup_logging();
    info!("Plexus started.");

    let args = CliArgs::parse();
    let mut config = Config::from_env()?;
    args.apply(&mut config);
    let config = Arc::new(config);

    let root = Allocator::root("plexus-root", config.max_global_memory);
    let producer = Producer::new(&root, Arc::clone(&config));

    let catalog = GraphCatalog::new();
    let creator = CatalogJobCreator::new(catalog, Arc::clone(&config));
    producer
        .register_handler(Arc::new(CypherActionHandler::new(creator.clone())))
        .await;
    producer
        .register_handler(Arc::new(GdsActionHandler::new(creator)))
        .await;

    let addr = config.socket_addr()?;
    info!("Serving Arrow Flight on {addr}");
    PlexusFlightService::new(producer).serve(addr).await
}
