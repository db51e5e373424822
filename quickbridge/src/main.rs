use anyhow::{Context, Result};
use clap::Parser;
use quickbridge::logging::{self, LogFormat};
use quickbridge::{BridgeConfig, Dispatcher, MemoryConnector, Registry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "quickbridge")]
#[command(about = "QuickBridge - JSON-lines database command bridge", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: json, pretty or compact
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let format = args.log_format.as_deref().unwrap_or(&config.logging.format);
    logging::init(level, LogFormat::parse(format));

    info!("Starting QuickBridge v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(Registry::new(Arc::new(MemoryConnector::new())));
    for database in config.databases.iter().cloned() {
        let alias = database.alias.clone();
        registry
            .add(database)
            .await
            .with_context(|| format!("failed to add database '{}'", alias))?;
    }
    registry.set_default_alias(config.default_alias.clone());
    let dispatcher = Dispatcher::new(registry.clone());

    // Single writer keeps response lines whole
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let response = dispatcher.handle(&line).await;
            if tx.send(response).is_err() {
                warn!("Response dropped: output closed");
            }
        });
    }

    while tasks.join_next().await.is_some() {}
    drop(tx);
    writer.await??;

    registry.shutdown().await;
    info!("QuickBridge stopped");
    Ok(())
}
