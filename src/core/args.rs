use clap::Parser;

use crate::core::Config;

#[derive(Parser, Debug, PartialEq)]
#[command(version, about)]
pub struct CliArgs {
    /// Override the listen host from the environment.
    #[arg(long)]
    pub host: Option<String>,
    /// Override the listen port from the environment.
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl CliArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}
