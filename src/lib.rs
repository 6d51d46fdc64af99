//! Library surface for the binary and for integration tests: builds a
//! `Server` from parsed arguments and runs the accept loop.

pub mod args;
pub mod command;
pub mod connection;
pub mod error;
pub mod rdb;
pub mod replica;
pub mod replication;
pub mod resp;
pub mod server;
pub mod store;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use args::Args;
use server::{Server, ServerInfo};

/// Builds the server context, loading any on-disk RDB snapshot, and spawns
/// the replica-side replication task if `--replicaof` was given.
pub fn build_server(args: &Args) -> anyhow::Result<Arc<Server>> {
    let info = ServerInfo::from_args(args);
    let mut store = store::KvStore::new();
    rdb::load_into(&info.dir, &info.dbfilename, &mut store)?;

    let master_of = info.master_of.clone();
    let server = Arc::new(Server::new(info, store));

    if let Some(master) = master_of {
        let server = server.clone();
        tokio::spawn(async move { replica::run(server, master).await });
    }

    Ok(server)
}

/// Runs the accept loop against an already-bound listener until the process
/// is killed or the listener errors out. Split from [`run`] so tests can
/// bind an ephemeral port and learn its number before serving.
pub async fn serve(server: Arc<Server>, listener: TcpListener) -> anyhow::Result<()> {
    info!(port = server.info.port, role = ?server.info.role, "listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            connection::handle_connection(stream, peer, server).await;
        });
    }
}

/// Builds the server context and runs the accept loop until the process is
/// killed.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let server = build_server(&args)?;
    let listener = TcpListener::bind(("0.0.0.0", server.info.port)).await?;
    serve(server, listener).await
}

pub fn init_tracing(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let result = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    if let Err(err) = result {
        error!("failed to install tracing subscriber: {}", err);
    }
}
