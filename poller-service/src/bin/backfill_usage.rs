//! One-shot historical import: fetches an explicit date range for every
//! configured meter and writes it through the normal validate + sink path.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use poller_service::{
    config::AppConfig,
    observability,
    pipeline::Pipeline,
    sinks::PostgresStatisticsSink,
    sources::UsageBackfillSource,
    statistics::StatisticPoint,
    transform::StatisticPointValidation,
};
use sqlx::postgres::PgPoolOptions;
use time::{format_description::FormatItem, macros::format_description, Date};
use tpu_client::auth::Credentials;
use tpu_client::TpuClient;

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: backfill-usage <from-date> <to-date>  (dates as YYYY-MM-DD)");
    }
    let from = Date::parse(&args[1], DATE_FORMAT).context("invalid from-date")?;
    let to = Date::parse(&args[2], DATE_FORMAT).context("invalid to-date")?;
    if from > to {
        bail!("from-date {from} is after to-date {to}");
    }

    let cfg = AppConfig::load()?;
    if cfg.meters.is_empty() {
        bail!("no meters configured; add [[meters]] entries to the config file");
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

    let source = UsageBackfillSource::new(Arc::new(client), cfg.meters.clone(), from, to);
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

    tracing::info!(%from, %to, "backfill complete");
    Ok(())
}
