//! Hub server - executor callbacks, spawning, and live events over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use conductor::io::init::RootPaths;
use conductor_hub::state::AppState;
use conductor_hub::watcher::{self, WatcherOptions};
use tracing::info;

#[derive(Parser)]
#[command(name = "conductor-hub")]
#[command(about = "Coordination hub for executors working on a conductor root")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on (0 picks a free port)
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Coordination root (contains conductor.toml)
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor::logging::init_with_default("conductor_hub=info,conductor=info");

    let args = Args::parse();
    let root = args.root.canonicalize().unwrap_or(args.root);
    let (paths, config) = RootPaths::load(&root)?;
    info!(root = %paths.root.display(), "starting conductor-hub");

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    let state = AppState::new(paths.clone(), &config, local);
    watcher::start_file_watcher(
        state.hub.clone(),
        paths,
        WatcherOptions {
            debounce: Duration::from_millis(config.watcher.debounce_ms),
            poll_interval: Duration::from_millis(config.watcher.poll_interval_ms),
        },
    );

    info!(addr = %local, "listening");
    axum::serve(listener, conductor_hub::app(state)).await?;

    Ok(())
}
