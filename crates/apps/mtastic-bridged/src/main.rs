mod capture;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mtastic_core::{
    BridgeConfig, Coordinator, JsonFileStore, LoopbackTransport, MemoryStore, StateStore,
};
use serde_json::{Map, Value};

#[derive(Parser, Debug)]
#[command(name = "mtastic-bridged", about = "Meshtastic MQTT device state bridge", version)]
struct Args {
    /// Bridge configuration (TOML).
    #[arg(long)]
    config: PathBuf,
    /// Captured traffic to replay.
    #[arg(long)]
    capture: PathBuf,
    /// Keep state in memory instead of the configured store directory.
    #[arg(long)]
    dry_run: bool,
    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = BridgeConfig::from_path(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    if config.devices.is_empty() {
        bail!("no devices configured in {}", args.config.display());
    }
    let messages = capture::load(&args.capture)?;

    let store: Arc<dyn StateStore> = if args.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let store = JsonFileStore::new(&config.store_dir);
        log::info!("state directory {}", store.dir().display());
        Arc::new(store)
    };
    let transport = LoopbackTransport::new();

    let mut tasks = Vec::with_capacity(config.devices.len());
    for device in config.devices {
        let mut coordinator = Coordinator::new(device, store.clone())?;
        coordinator.restore().await.with_context(|| format!("restoring {}", coordinator.device()))?;
        let listener = coordinator.listen(&transport).await?;
        tasks.push(tokio::spawn(async move {
            coordinator.serve(listener).await;
            coordinator
        }));
    }

    log::info!("replaying {} captured messages", messages.len());
    for message in messages {
        if transport.publish(&message.topic, message.payload) == 0 {
            log::debug!("no subscriber for {}", message.topic);
        }
    }
    transport.close();

    let mut report = Map::new();
    for task in tasks {
        let coordinator = task.await.context("coordinator task panicked")?;
        report.insert(coordinator.device().to_string(), serde_json::to_value(coordinator.state())?);
    }
    println!("{}", serde_json::to_string_pretty(&Value::Object(report))?);
    Ok(())
}
