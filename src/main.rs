use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use leasewarden::entity::MemoryEntityStore;
use leasewarden::leases::LeaseGrant;
use leasewarden::store::InMemoryLeaseStore;
use leasewarden::{Config, Coordinator, RequestKind};

mod cli;
use cli::{Cli, Commands};

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Could not load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::ShowConfig => {
            let rendered = toml::to_string_pretty(&config).context("Could not render configuration")?;
            print!("{rendered}");
        }
        Commands::Contend {
            key,
            workers,
            hold_ms,
            batch,
        } => contend(config, key, workers, Duration::from_millis(hold_ms), batch).await?,
    }
    Ok(())
}

/// Have `workers` requests take turns on the lock for `key`
async fn contend(config: Config, key: String, workers: usize, hold: Duration, batch: bool) -> Result<()> {
    let coordinator = Coordinator::new(
        config,
        Arc::new(InMemoryLeaseStore::new()),
        Arc::new(MemoryEntityStore::new()),
    )?;
    let kind = if batch { RequestKind::Cron } else { RequestKind::Interactive };
    info!(key = %key, workers, hold_ms = hold.as_millis() as u64, kind = %kind, "Contending for lock");

    let started = Instant::now();
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let coordinator = coordinator.clone();
        let key = key.clone();
        let kind = kind.clone();
        handles.push(tokio::spawn(async move {
            let outcome = coordinator
                .run_request(kind, |ctx| async move {
                    let lease = ctx.acquire_lock(&key, None, None).await?;
                    let acquired_after = started.elapsed();
                    sleep(hold).await;
                    if lease.time_remaining(Instant::now()).is_none() {
                        warn!(key = %key, worker, "Lease expired before release; exclusion was lost");
                    }
                    ctx.release_lock(&key).await;
                    Ok((lease.grant, acquired_after))
                })
                .await;
            (worker, outcome)
        }));
    }

    let mut timeline = Vec::with_capacity(workers);
    for handle in handles {
        timeline.push(handle.await.context("Worker task failed")?);
    }
    timeline.sort_by_key(|(_, outcome)| match outcome {
        Ok((_, after)) => *after,
        Err(_) => Duration::MAX,
    });

    for (worker, outcome) in timeline {
        match outcome {
            Ok((grant, after)) => {
                let how = match grant {
                    LeaseGrant::Acquired { waited } if waited.is_zero() => "immediately".to_string(),
                    LeaseGrant::Acquired { waited } => format!("after waiting {waited:?}"),
                    LeaseGrant::Reentered => "by re-entry".to_string(),
                    LeaseGrant::FailedOpen => "fail-open (store degraded)".to_string(),
                };
                println!("worker {worker:>3}: acquired at {:>6} ms, {how}", after.as_millis());
            }
            Err(e) => println!("worker {worker:>3}: {e}"),
        }
    }
    Ok(())
}
