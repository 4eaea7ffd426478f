mod agent_version;
mod api;
mod carving;
mod collaborators;
mod collector;
mod config;
mod database;
mod distributed;
mod enrollments;
mod error;
mod ingest;
mod platform;
mod schema;
mod selector;
mod server;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::debug;

use crate::api::state::AppState;
use crate::config::{Config, CONFIG};
use crate::server::NodeServer;

#[derive(Parser)]
#[command(
    name = "nodegate",
    version,
    about = "Device check-in backend: enrollment, distributed queries, log ingestion, file carving"
)]
struct Args {
    #[command(subcommand)]
    command: NodeGateCommand,
}

#[derive(Subcommand)]
enum NodeGateCommand {
    /// Run the check-in server
    Serve {
        /// Listen host (overrides the config file)
        #[arg(long = "host")]
        host: Option<String>,

        /// Listen port (overrides the config file)
        #[arg(long = "port", short = 'p')]
        port: Option<u16>,

        /// Database file path (overrides the config file)
        #[arg(long = "db")]
        db_path: Option<String>,

        /// Data directory for carve blocks and archives (overrides the config file)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Set RUST_LOG to one of: ERROR → WARN → INFO → DEBUG → TRACE
    env_logger::init();
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    let args = Args::parse();

    let project_dirs = ProjectDirs::from("", "", "nodegate");
    let mut config = Config::load_config(project_dirs.as_ref());

    let NodeGateCommand::Serve {
        host,
        port,
        db_path,
        data_dir,
    } = args.command;

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(db_path) = db_path {
        config.storage.db_path = db_path;
    }
    if let Some(data_dir) = data_dir {
        config.storage.data_dir = data_dir;
    }

    let config = CONFIG.get_or_init(|| config);
    let state = AppState::from_config(config);

    let server = NodeServer::new(config.server.host.clone(), config.server.port, state);
    if let Err(err) = server.start().await {
        log::error!("{err:?}");
        eprintln!("{err}");
        std::process::exit(1);
    }
}
