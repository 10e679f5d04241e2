//! Store probe.
//!
//! Opens a store from flags or `ENTITY_STORE_*` variables, runs its
//! liveness probe, optionally reads one entity, and prints a JSON summary.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use helios_entity_store::core::StoreBackend;
use helios_entity_store::{
    CallContext, EntityId, PartitionKey, StoreConfig, StoreFactory, StoreType,
};
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "store-probe")]
#[command(about = "Checks that an entity store is reachable")]
struct ProbeArgs {
    /// Store type (document, table, local-file).
    #[arg(long, env = "ENTITY_STORE_TYPE")]
    store_type: StoreType,

    /// Connection string for document and table stores.
    #[arg(long, env = "ENTITY_STORE_CONNECTION_STRING")]
    connection_string: Option<String>,

    /// Database name for document stores.
    #[arg(long, env = "ENTITY_STORE_DATABASE_NAME")]
    database_name: Option<String>,

    /// Root directory for local file stores.
    #[arg(long, env = "ENTITY_STORE_ROOT_PATH")]
    root_path: Option<PathBuf>,

    /// Collection or table name.
    #[arg(long, env = "ENTITY_STORE_COLLECTION")]
    collection: Option<String>,

    /// Deadline for each call, e.g. "500ms" or "5s".
    #[arg(long, env = "ENTITY_STORE_TIMEOUT", default_value = "5s")]
    timeout: humantime::Duration,

    /// Entity id to read after probing.
    #[arg(long)]
    get: Option<String>,

    /// Partition of the entity given with --get.
    #[arg(long, default_value = "")]
    partition: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "ENTITY_STORE_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

impl ProbeArgs {
    fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(self.store_type).with_default_timeout(*self.timeout);
        config.connection_string = self.connection_string.clone();
        config.database_name = self.database_name.clone();
        config.root_path = self.root_path.clone();
        config.collection = self.collection.clone();
        config
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("helios_entity_store={},store_probe={}", level, level))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(args: &ProbeArgs) -> anyhow::Result<Value> {
    let started = Instant::now();
    let store = StoreFactory::open(&args.store_config())
        .await
        .with_context(|| format!("failed to open {} store", args.store_type))?;
    let opened_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(backend = store.backend_name(), opened_ms, "store opened");

    let capabilities: Vec<String> = store
        .capabilities()
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut summary = json!({
        "ok": true,
        "store_type": args.store_type,
        "backend": store.backend_name(),
        "capabilities": capabilities,
        "open_and_probe_ms": opened_ms,
    });

    if let Some(id) = &args.get {
        let ctx = CallContext::new().with_label("probe-get");
        let record = store
            .get(&ctx, &EntityId::new(id.as_str()), &PartitionKey::new(args.partition.as_str()))
            .await
            .with_context(|| format!("failed to read entity '{}'", id))?;
        summary["entity"] = serde_json::to_value(&record)?;
    }

    store.close().await.context("failed to close store")?;
    Ok(summary)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ProbeArgs::parse();
    init_logging(&args.log_level);

    match run(&args).await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(e) => {
            let summary = json!({
                "ok": false,
                "store_type": args.store_type,
                "error": format!("{:#}", e),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            std::process::exit(1);
        }
    }
}
