use std::sync::Arc;

use time::Date;
use tpu_client::TpuClient;

use crate::config::MeterConfig;
use crate::pipeline::{PipelineError, Record, RecordStream, Source};
use crate::sources::usage_poll::fetch_meter_window;
use crate::statistics::StatisticPoint;

/// One-shot source for historical imports: fetches an explicit date range
/// for every configured meter, emits the points, then ends the stream.
pub struct UsageBackfillSource {
    client: Arc<TpuClient>,
    meters: Vec<MeterConfig>,
    from: Date,
    to: Date,
}

impl UsageBackfillSource {
    pub fn new(client: Arc<TpuClient>, meters: Vec<MeterConfig>, from: Date, to: Date) -> Self {
        Self {
            client,
            meters,
            from,
            to,
        }
    }
}

#[async_trait::async_trait]
impl Source<StatisticPoint> for UsageBackfillSource {
    async fn stream(&self) -> RecordStream<StatisticPoint> {
        let client = self.client.clone();
        let meters = self.meters.clone();
        let (from, to) = (self.from, self.to);

        let s = async_stream::stream! {
            for meter in &meters {
                match fetch_meter_window(&client, meter, from, to).await {
                    Ok(points) => {
                        tracing::info!(
                            meter = %meter.meter_number,
                            count = points.len(),
                            "backfill fetched readings"
                        );
                        for point in points {
                            yield Ok(Record::now(point));
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            meter = %meter.meter_number,
                            "backfill fetch failed"
                        );
                        yield Err(PipelineError::Source(format!(
                            "meter {}: {e}",
                            meter.meter_number
                        )));
                    }
                }
            }
        };

        Box::pin(s)
    }
}
