//! `stockd` binary entry point.

use clap::Parser;
use stockd_server::telemetry::init_tracing;
use stockd_server::{CliArgs, ConfigSource, Server};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let source = ConfigSource::from_args(args);
    let config = source.load()?;

    init_tracing(&config.log_level, config.log_format)?;
    info!(
        host = %config.network.host,
        port = config.network.port,
        max_workers = config.tunables.max_workers,
        ttl_secs = config.tunables.ttl.as_secs(),
        persistence = config.tunables.database.persistence,
        "starting stockd"
    );

    Server::new(config, source).run()
}
