// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use bucketstore::api::handler;
use bucketstore::config::Config;
use bucketstore::observability::tracing_setup;
use bucketstore::storage::Storage;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "bucketstore")]
#[command(about = "Sharded on-disk bucket store with peer-to-peer tar transfer", long_about = None)]
struct Args {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_setup::init();

    let args = Args::parse();
    let cfg = Config::from_path(&args.config)?;

    // Command line args override config file
    let addr: SocketAddr = args.listen.as_ref().unwrap_or(&cfg.listen_addr).parse()?;

    let storage = Arc::new(Storage::new(&cfg).await?);
    tracing::info!(root_dir = %cfg.root_dir, "storage initialized");

    let app = handler::router(storage.clone());
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("bucketstore listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::warn!("ctrl-c received, shutting down");
        })
        .await?;

    storage.shutdown().await;
    tracing::info!("trasher stopped, bye");

    Ok(())
}
