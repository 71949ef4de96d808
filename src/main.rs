use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use collab_server::{AppState, server};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "0.0.0.0:3030")]
    host: SocketAddr,
    #[clap(short, long, default_value = "storage")]
    storage: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = collab_server::ServerConfig::from_env().expect("loading configuration from env");
    config.storage = args.storage;

    let state = AppState::new(config).await.expect("initializing server state");

    info!("starting server on http://{}", args.host);

    let listener = tokio::net::TcpListener::bind(args.host)
        .await
        .expect("unable to bind to host");
    axum::serve(listener, server(state.clone()).layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.expect("listening for ctrl-c")
        })
        .await
        .unwrap();

    info!("server has shut down, flushing room snapshots");
    state.shutdown().await;
}
