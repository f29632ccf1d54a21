use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bftp_server::registry::Registry;
use bftp_server::server;
use bftp_store::FileStore;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "bftpd")]
#[command(version, about = "bftp file server", long_about = None)]
struct Cli {
    /// TCP port to listen on
    #[arg(short, long)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Directory backing the file store
    #[arg(long, env = "BFTP_ROOT", default_value = "files")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let store = Arc::new(FileStore::new(&cli.root)?);
    let registry = Arc::new(Registry::new());

    let listener = TcpListener::bind((cli.bind, cli.port)).await?;
    info!(addr = %listener.local_addr()?, root = %store.root().display(), "bftpd listening");

    server::serve(listener, registry, store).await
}
