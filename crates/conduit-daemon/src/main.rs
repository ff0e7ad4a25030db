use std::sync::Arc;

use clap::Parser;
use conduit_core::config::{ensure_parent_dir, ConduitConfig, SourceSeed};
use conduit_core::{SourceDescriptor, SourceId, SourceKind};
use conduit_scheduler::{AdapterRegistry, Scheduler, SqliteSourceStore, TracingSink};
use tracing::{error, info, warn};

mod adapter;

use adapter::CommandAdapter;

#[derive(Debug, Parser)]
#[command(name = "conduitd", version, about = "Multi-source data sync scheduler")]
struct Args {
    /// Config file (defaults to $CONDUIT_CONFIG, then ~/.conduit/conduit.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_daemon=info,conduit_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("CONDUIT_CONFIG").ok());

    if args.check {
        let config = ConduitConfig::load(config_path.as_deref())?;
        info!(
            adapters = config.adapters.len(),
            sources = config.sources.len(),
            "configuration is valid"
        );
        return Ok(());
    }

    let config = ConduitConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ConduitConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(SqliteSourceStore::new(db)?);

    let adapters = build_adapters(&config)?;
    if adapters.kinds().is_empty() {
        warn!("no adapters configured; sources cannot be synced");
    }

    let scheduler = Scheduler::start(
        config.scheduler.clone(),
        store,
        adapters,
        Arc::new(TracingSink),
    )?;
    seed_sources(&scheduler, &config.sources);

    info!("conduitd running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    scheduler.shutdown().await;
    Ok(())
}

/// One command adapter per configured kind.
fn build_adapters(config: &ConduitConfig) -> anyhow::Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    for (name, command) in &config.adapters {
        let kind: SourceKind = name.parse()?;
        registry.register(Arc::new(CommandAdapter::new(kind, command)));
        info!(%kind, command = %command.command, "adapter configured");
    }
    Ok(registry)
}

/// Register config-declared sources the store does not know yet, and apply
/// schedule changes to those it does. A bad seed is logged and skipped.
fn seed_sources(scheduler: &Scheduler, seeds: &[SourceSeed]) {
    for seed in seeds {
        let id = SourceId::new(seed.id.clone());
        let result = match scheduler.get_status(&id) {
            None => scheduler
                .register_source(SourceDescriptor::new(
                    id.clone(),
                    seed.kind,
                    seed.schedule.clone(),
                    seed.timezone.clone(),
                ))
                .map(|_| ()),
            Some(current) if current.schedule != seed.schedule || current.timezone != seed.timezone => {
                scheduler
                    .update_schedule(&id, &seed.schedule, &seed.timezone)
                    .map(|_| ())
            }
            Some(_) => Ok(()),
        };
        if let Err(e) = result {
            error!(source_id = %id, code = e.code(), error = %e, "failed to seed source");
        }
    }
}
