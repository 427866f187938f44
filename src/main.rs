//! Granary - accrual scheduler and referral commission engine

use chrono::Duration;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use granary::{
    accrual::PositionRegistry,
    config::Args,
    coordinator::CycleCoordinator,
    db::MongoClient,
    ledger::{Ledger, MemoryLedger, MongoLedger},
    logging::AuditLogger,
    reconcile::Reconciler,
    referral::{CommissionDistributor, CommissionTable, RatesHandle},
    scheduler::{EpochScheduler, TrackLease},
    types::Track,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("granary={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Granary - Accrual Scheduler");
    info!("  build {} ({})", env!("GIT_COMMIT_SHORT"), env!("BUILD_TIMESTAMP"));
    info!("======================================");
    info!("Instance ID: {}", args.instance_id);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MongoDB: {}", args.mongodb_uri);
    info!(
        "Intervals: uni={}s ton_boost={}s",
        args.uni_interval_secs, args.ton_boost_interval_secs
    );
    info!("Workers: {}", args.worker_count);
    info!("Page size: {}", args.page_size);
    info!("======================================");

    // Open the ledger (in-process in dev mode, MongoDB otherwise)
    let ledger: Arc<dyn Ledger> = if args.dev_mode {
        warn!("Dev mode: in-process ledger, nothing is persisted");
        Arc::new(MemoryLedger::new())
    } else {
        let client = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
            Ok(client) => {
                info!("MongoDB connected successfully");
                client
            }
            Err(e) => {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        };
        match MongoLedger::new(client).await {
            Ok(ledger) => Arc::new(ledger),
            Err(e) => {
                error!("Ledger initialization failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    // Audit event log
    let audit = AuditLogger::new(args.instance_id.to_string());
    if let Some(ref path) = args.audit_log_path {
        if let Err(e) = audit.init_file(path.clone()).await {
            error!("Could not open audit log {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }

    // Commission rate table, file-backed when configured
    let rates = match args.rates_file {
        Some(ref path) => match RatesHandle::load_file(path).await {
            Ok(table) => {
                info!("Commission table loaded from {} ({} levels)", path.display(), table.depth());
                RatesHandle::new(table)
            }
            Err(e) => {
                error!("Could not load commission rates from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => RatesHandle::new(CommissionTable::default()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let _rates_reload = args.rates_file.clone().map(|path| {
        rates.spawn_reload_task(
            path,
            StdDuration::from_secs(args.rates_reload_secs),
            shutdown_rx.clone(),
        )
    });

    let registry = PositionRegistry::new(
        Arc::clone(&ledger),
        Duration::seconds(args.min_accrual_window_secs as i64),
        args.page_size,
    );
    let distributor = CommissionDistributor::new(Arc::clone(&ledger), rates, audit.clone());
    let coordinator = CycleCoordinator::new(
        Arc::clone(&ledger),
        registry,
        distributor.clone(),
        audit,
        args.worker_count,
    );

    // One scheduler task per track
    let mut tasks = Vec::new();
    for track in Track::ALL {
        let lease = TrackLease::new(
            Arc::clone(&ledger),
            track,
            format!("granary-{}", args.instance_id),
            Duration::seconds(args.lease_ttl_secs as i64),
        );
        let scheduler = EpochScheduler::new(
            Arc::clone(&ledger),
            coordinator.clone(),
            lease,
            track,
            Duration::seconds(args.interval_secs(track) as i64),
            args.lease_jitter_ms,
        );
        tasks.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
    }

    // Commission reconciliation
    let reconciler = Reconciler::new(
        Arc::clone(&ledger),
        distributor,
        Duration::seconds(args.reconcile_lookback_secs as i64),
        StdDuration::from_secs(args.reconcile_interval_secs),
        args.reconcile_batch_size,
    );
    tasks.push(tokio::spawn(reconciler.run(shutdown_rx.clone())));

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping schedulers");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    info!("Granary stopped");

    Ok(())
}
