use std::sync::Arc;
use std::time::Duration;

use time::{Date, OffsetDateTime};
use tokio::time::MissedTickBehavior;
use tpu_client::domain::ServiceKind;
use tpu_client::TpuClient;

use crate::config::MeterConfig;
use crate::pipeline::{PipelineError, Record, RecordStream, Source};
use crate::statistics::{point_for_reading, StatisticPoint};

/// Polls the portal for every configured meter on a fixed cadence and
/// emits one `StatisticPoint` per daily reading in the lookback window.
///
/// A failed fetch means no update for that meter this cycle: the error is
/// logged and pushed downstream as a record-level error, never a stream
/// abort, so the next cycle runs as scheduled and history is untouched.
pub struct UsagePollSource {
    client: Arc<TpuClient>,
    meters: Vec<MeterConfig>,
    period: Duration,
    lookback_days: u32,
}

impl UsagePollSource {
    pub fn new(
        client: Arc<TpuClient>,
        meters: Vec<MeterConfig>,
        period: Duration,
        lookback_days: u32,
    ) -> Self {
        Self {
            client,
            meters,
            period,
            lookback_days,
        }
    }
}

/// Fetches one meter's readings over `from..=to` and maps them to
/// statistics points.
pub(crate) async fn fetch_meter_window(
    client: &TpuClient,
    meter: &MeterConfig,
    from: Date,
    to: Date,
) -> tpu_client::Result<Vec<StatisticPoint>> {
    let readings = match meter.kind {
        ServiceKind::Power => {
            client
                .get_power_usage(
                    &meter.meter_number,
                    &meter.service_id,
                    &meter.service_number,
                    from,
                    to,
                )
                .await?
        }
        ServiceKind::Water => {
            client
                .get_water_usage(
                    &meter.meter_number,
                    &meter.service_id,
                    &meter.service_number,
                    from,
                    to,
                )
                .await?
        }
    };

    Ok(readings
        .iter()
        .map(|r| point_for_reading(meter.kind, &meter.meter_number, r))
        .collect())
}

#[async_trait::async_trait]
impl Source<StatisticPoint> for UsagePollSource {
    async fn stream(&self) -> RecordStream<StatisticPoint> {
        let client = self.client.clone();
        let meters = self.meters.clone();
        let period = self.period;
        let lookback = i64::from(self.lookback_days);

        let s = async_stream::stream! {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                // The portal reports provider-local (Pacific) calendar days.
                // The UTC date is at most hours ahead, well inside the
                // multi-day lookback, so it serves as the window edge.
                let today = OffsetDateTime::now_utc().date();
                let from = today - time::Duration::days(lookback);

                for meter in &meters {
                    match fetch_meter_window(&client, meter, from, today).await {
                        Ok(points) => {
                            tracing::debug!(
                                meter = %meter.meter_number,
                                count = points.len(),
                                "poll cycle fetched readings"
                            );
                            metrics::counter!("usage_poll_readings_total")
                                .increment(points.len() as u64);
                            for point in points {
                                yield Ok(Record::now(point));
                            }
                        }
                        Err(e) => {
                            if matches!(e, tpu_client::ClientError::Auth(_)) {
                                metrics::counter!("usage_poll_auth_failures_total").increment(1);
                                tracing::error!(
                                    error = %e,
                                    meter = %meter.meter_number,
                                    "authentication failed; credentials need to be re-entered"
                                );
                            } else {
                                tracing::warn!(
                                    error = %e,
                                    meter = %meter.meter_number,
                                    "poll failed; no update this cycle"
                                );
                            }
                            metrics::counter!("usage_poll_errors_total").increment(1);
                            yield Err(PipelineError::Source(format!(
                                "meter {}: {e}",
                                meter.meter_number
                            )));
                        }
                    }
                }
            }
        };

        Box::pin(s)
    }
}
