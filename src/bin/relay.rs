use std::net::SocketAddr;

use clap::Parser;

use palaver::config::{Cli, Config};
use palaver::logging;
use palaver::relay::{app, RelayState};
use palaver::tlog;

#[tokio::main]
async fn main() {
    logging::init();
    let config = Config::from_cli_and_env(Cli::parse());
    let state = RelayState::new(config.relay.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.bind_addr));
    tlog!("relay: listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap_or_else(|error| panic!("server error: {error}"));
}
