use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use poller_service::{
    config::AppConfig,
    metrics_server, observability,
    pipeline::Pipeline,
    sinks::PostgresStatisticsSink,
    sources::UsagePollSource,
    statistics::StatisticPoint,
    transform::StatisticPointValidation,
};
use sqlx::postgres::PgPoolOptions;
use tpu_client::auth::Credentials;
use tpu_client::TpuClient;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    if cfg.meters.is_empty() {
        bail!("no meters configured; add [[meters]] entries to the config file");
    }

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await
        .context("connecting to the statistics database")?;

    let client = TpuClient::with_base_url(
        &cfg.portal.base_url,
        Credentials::new(cfg.portal.username.as_str(), cfg.portal.password.as_str()),
    )?;

    tracing::info!(
        meters = cfg.meters.len(),
        interval_hours = cfg.poll.interval_hours,
        lookback_days = cfg.poll.lookback_days,
        "starting usage poller"
    );

    let source = UsagePollSource::new(
        Arc::new(client),
        cfg.meters.clone(),
        Duration::from_secs(cfg.poll.interval_hours.max(1) * 3600),
        cfg.poll.lookback_days,
    );
    let sink = PostgresStatisticsSink::new(
        pool,
        cfg.sink.batch_size,
        cfg.sink.max_retries,
        Duration::from_millis(cfg.sink.retry_backoff_ms),
        Duration::from_millis(cfg.sink.flush_interval_ms),
    );

    let pipeline: Pipeline<_, StatisticPoint, _> = Pipeline {
        source,
        validator: Some(Arc::new(StatisticPointValidation)),
        sink,
    };

    pipeline.run().await?;

    Ok(())
}
