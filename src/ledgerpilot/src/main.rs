//! LedgerPilot — self-driving operational control plane for a multi-tenant
//! financial ledger platform.
//!
//! Main entry point that wires the components together and starts the
//! control loops and the API server.

use clap::Parser;
use ledgerpilot_api::{ApiServer, ControlPlane};
use ledgerpilot_capacity::CapacityTier;
use ledgerpilot_core::clock::system_clock;
use ledgerpilot_core::config::AppConfig;
use ledgerpilot_core::ControlPlaneResult;
use ledgerpilot_deployment::migrations::{Migration, MigrationExecutor};
use ledgerpilot_integrity::store::{EntryType, InMemoryLedger, LedgerStore};
use ledgerpilot_remediation::InfrastructureExecutor;
use ledgerpilot_telemetry::{MetricsPatch, MetricsSource};
use rand::Rng;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ledgerpilot")]
#[command(about = "Self-driving operational control plane for a multi-tenant ledger platform")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "LEDGERPILOT__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "LEDGERPILOT__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Metrics exporter port (overrides config)
    #[arg(long, env = "LEDGERPILOT__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Capacity tier to start on
    #[arg(long, default_value = "starter")]
    tier: String,

    /// Number of demo tenants to seed into the in-memory ledger
    #[arg(long, default_value_t = 3)]
    seed_tenants: u64,
}

/// Synthetic platform probe used when no real sub-collectors are wired in.
/// Reports nominal values with some jitter so the control loops have live
/// data to chew on.
struct PlatformProbeSource;

#[async_trait::async_trait]
impl MetricsSource for PlatformProbeSource {
    fn name(&self) -> &'static str {
        "platform"
    }

    async fn sample(&self) -> anyhow::Result<MetricsPatch> {
        let mut rng = rand::thread_rng();
        Ok(MetricsPatch {
            storage_load_pct: Some(42.0 + rng.gen_range(-4.0..4.0)),
            connection_count: Some(rng.gen_range(40..60)),
            connection_limit: Some(200),
            replication_lag_ms: Some(rng.gen_range(5.0..40.0)),
            latency_p50_ms: Some(rng.gen_range(8.0..15.0)),
            latency_p95_ms: Some(rng.gen_range(40.0..90.0)),
            latency_p99_ms: Some(rng.gen_range(120.0..250.0)),
            error_rate: Some(rng.gen_range(0.0..0.002)),
            throughput_rps: Some(rng.gen_range(800.0..1200.0)),
            cache_hit_rate: Some(rng.gen_range(0.88..0.97)),
            queue_depth: Some(rng.gen_range(0..500)),
            memory_used_pct: Some(rng.gen_range(50.0..65.0)),
            active_sessions: Some(rng.gen_range(100..400)),
            disk_used_pct: Some(rng.gen_range(35.0..45.0)),
        })
    }
}

/// Executor that logs the requested infrastructure action and reports
/// success. Stands in for the orchestration-platform client in local mode.
struct LoggingExecutor;

#[async_trait::async_trait]
impl InfrastructureExecutor for LoggingExecutor {
    async fn scale_workers(&self, delta: i32) -> ControlPlaneResult<()> {
        info!(delta, "Executor: scale workers");
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> ControlPlaneResult<()> {
        info!(service = name, "Executor: restart service");
        Ok(())
    }

    async fn terminate_long_running_operations(
        &self,
        threshold_secs: u64,
    ) -> ControlPlaneResult<()> {
        info!(threshold_secs, "Executor: terminate long-running operations");
        Ok(())
    }

    async fn provision_read_replica(&self) -> ControlPlaneResult<()> {
        info!("Executor: provision read replica");
        Ok(())
    }

    async fn provision_caching_layer(&self) -> ControlPlaneResult<()> {
        info!("Executor: provision caching layer");
        Ok(())
    }

    async fn provision_connection_pool(&self) -> ControlPlaneResult<()> {
        info!("Executor: provision connection pool");
        Ok(())
    }
}

/// Migration executor that logs each batch and completes in one pass.
struct LoggingMigrationExecutor;

#[async_trait::async_trait]
impl MigrationExecutor for LoggingMigrationExecutor {
    async fn apply_batch(
        &self,
        migration: &Migration,
        cursor: u64,
    ) -> ControlPlaneResult<Option<u64>> {
        info!(
            migration_id = %migration.id,
            phase = ?migration.phase,
            cursor,
            script = %migration.script,
            "Applying migration batch"
        );
        Ok(None)
    }

    async fn rollback(&self, migration: &Migration) -> ControlPlaneResult<()> {
        info!(
            migration_id = %migration.id,
            rollback_script = %migration.rollback_script,
            "Rolling back migration"
        );
        Ok(())
    }
}

fn seed_ledger(ledger: &InMemoryLedger, tenants: u64) {
    for _ in 0..tenants {
        let tenant = Uuid::new_v4();
        ledger.post_entry(
            tenant,
            EntryType::Invoice,
            250_000,
            Some(format!("inv-{tenant}")),
        );
        ledger.post_entry(tenant, EntryType::Payment, 250_000, Some(format!("pay-{tenant}")));
        ledger.post_entry(tenant, EntryType::Bill, 90_000, Some(format!("bill-{tenant}")));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgerpilot=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("LedgerPilot starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    let tier = CapacityTier::by_name(&cli.tier)
        .ok_or_else(|| anyhow::anyhow!("unknown capacity tier: {}", cli.tier))?;

    let ledger = Arc::new(InMemoryLedger::new());
    seed_ledger(&ledger, cli.seed_tenants);

    let plane = ControlPlane::build(
        config.clone(),
        vec![Arc::new(PlatformProbeSource)],
        ledger.clone(),
        Arc::new(LoggingExecutor),
        Arc::new(LoggingMigrationExecutor),
        system_clock(),
        tier,
    );
    plane.planner.set_active_tenants(cli.seed_tenants);

    // Metrics collection loop
    let p = plane.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(p.config.collector.interval_secs));
        loop {
            interval.tick().await;
            p.collector.tick().await;
        }
    });

    // Health evaluation loop: feed transitions to the remediator and the
    // overall level to the flag manager.
    let p = plane.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(p.config.health.interval_secs));
        loop {
            interval.tick().await;
            if let Some((report, transitions)) = p.health.tick(&p.collector) {
                for transition in &transitions {
                    let _ = p.remediator.on_transition(transition).await;
                }
                p.flags.tick(report.overall);
            }
            let _ = p.remediator.observe_window(&p.collector.window(10)).await;
        }
    });

    // Integrity check loops
    let p = plane.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            p.config.integrity.hourly_interval_secs,
        ));
        loop {
            interval.tick().await;
            p.validator.run_hourly().await;
        }
    });
    let p = plane.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            p.config.integrity.daily_interval_secs,
        ));
        loop {
            interval.tick().await;
            p.validator.run_daily().await;
        }
    });

    // Capacity loop
    let p = plane.clone();
    let ledger_for_capacity = ledger.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(p.config.capacity.interval_secs));
        loop {
            interval.tick().await;
            match ledger_for_capacity.tenant_ids().await {
                Ok(ids) => p.planner.set_active_tenants(ids.len() as u64),
                Err(e) => error!(error = %e, "Failed to count tenants"),
            }
            p.planner.tick().await;
        }
    });

    // Dashboard snapshot push loop
    let p = plane.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(p.config.api.push_interval_secs));
        loop {
            interval.tick().await;
            p.publish_snapshot();
        }
    });

    let api_server = ApiServer::new(plane);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("LedgerPilot control plane is ready");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
