use std::{io::IsTerminal, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_hub::{
    cli::{Cli, Command, ServerArgs},
    client,
    hub::Hub,
    store::{FileStore, MemoryStore, MessageStore},
};

fn init_tracing(default_level: &str, to_stderr: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if to_stderr {
        builder
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        builder.with_ansi(std::io::stdout().is_terminal()).try_init()
    };
}

async fn open_store(args: &ServerArgs) -> Result<Arc<dyn MessageStore>> {
    match &args.history_file {
        Some(path) => {
            let store = FileStore::open(path)
                .await
                .with_context(|| format!("failed to open history file {}", path.display()))?;
            info!(path = %store.path().display(), "persisting history to file");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let store = open_store(&args).await?;
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let hub = Hub::new(listener, store, args.hub_config());
    let addr = hub.local_addr()?;
    info!("hub listening on {}", addr);

    if let Err(err) = hub.run_until_ctrl_c().await {
        warn!("hub exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            init_tracing("info", false);
            run_server(args).await?;
        }
        Command::Client(args) => {
            init_tracing("warn", true);
            client::run(args).await?;
        }
    }

    Ok(())
}
