use std::net::SocketAddr;

use clap::Parser;
use scramjet_core::SyncEngine;
use scramjet_server::cli::{Cli, Commands};
use scramjet_server::routes::status;
use scramjet_server::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scramjet_server::telemetry::init_from_env()?;
    let cli = Cli::parse();

    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8855,
    });

    let cfg = cli.db.engine_config()?;
    let engine = SyncEngine::connect(&cfg).await?;

    match cmd {
        Commands::Serve { host, port } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            engine.migrate().await?;
            server::serve(addr, AppState::new(engine)).await?;
        }
        Commands::Migrate { reset } => {
            if reset {
                scramjet_core::schema::drop_all(engine.context().pool()).await?;
            }
            engine.migrate().await?;
            tracing::info!(reset, "migrations applied");
        }
        Commands::Status { type_name } => {
            let report = status::collect(&engine, &type_name).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Purge { type_name } => {
            let report = engine.purge_deleted(&type_name).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
