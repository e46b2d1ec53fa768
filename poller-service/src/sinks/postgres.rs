use std::collections::HashMap;
use std::time::Duration;

use futures::{Stream, StreamExt};
use sqlx::{postgres::PgPool, Postgres, QueryBuilder};
use time::{Date, OffsetDateTime};

use crate::pipeline::{PipelineError, Record, Sink};
use crate::statistics::StatisticPoint;

/// Sink writing readings into the host's long-term statistics table:
///
/// ```sql
/// CREATE TABLE usage_statistics (
///     statistic_id TEXT             NOT NULL,
///     start_ts     TIMESTAMPTZ      NOT NULL,
///     state        DOUBLE PRECISION NOT NULL,
///     running_sum  DOUBLE PRECISION NOT NULL,
///     unit         TEXT             NOT NULL
/// );
/// ```
///
/// Each row carries the day's consumption (`state`) and a per-statistic
/// running sum, resumed from the last stored row, so dashboards can chart
/// day-over-day deltas from a `total_increasing` series. A date at or
/// before the last stored row counts as already imported and is skipped,
/// which makes re-polling the same window a no-op.
pub struct PostgresStatisticsSink {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    flush_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
struct StatisticRow {
    statistic_id: String,
    start_ts: OffsetDateTime,
    state: f64,
    running_sum: f64,
    unit: String,
}

#[derive(Debug, Clone, Default)]
struct SumState {
    last_start: Option<OffsetDateTime>,
    sum: f64,
}

fn start_of_day_utc(date: Date) -> OffsetDateTime {
    date.midnight().assume_utc()
}

/// Turns a batch of points into insert-ready rows, advancing each
/// statistic's running sum and skipping already-imported dates.
///
/// A statistic with no stored history gets a zero baseline row one day
/// before its first reading, so the first day charts as a delta instead of
/// a cumulative jump. `sums` must hold the stored state for every
/// statistic id in `points`; a missing entry means the store is empty for
/// that id.
fn rows_for_batch(
    points: &[StatisticPoint],
    sums: &mut HashMap<String, SumState>,
) -> Vec<StatisticRow> {
    let mut ordered: Vec<&StatisticPoint> = points.iter().collect();
    ordered.sort_by(|a, b| {
        (a.statistic_id.as_str(), a.date).cmp(&(b.statistic_id.as_str(), b.date))
    });

    let mut rows = Vec::new();
    for point in ordered {
        let entry = sums.entry(point.statistic_id.clone()).or_default();
        let start_ts = start_of_day_utc(point.date);

        if let Some(last) = entry.last_start {
            if start_ts <= last {
                continue;
            }
        } else {
            let baseline = start_ts - time::Duration::days(1);
            rows.push(StatisticRow {
                statistic_id: point.statistic_id.clone(),
                start_ts: baseline,
                state: 0.0,
                running_sum: 0.0,
                unit: point.unit.as_str().to_string(),
            });
            entry.last_start = Some(baseline);
        }

        entry.sum += point.consumption;
        entry.last_start = Some(start_ts);
        rows.push(StatisticRow {
            statistic_id: point.statistic_id.clone(),
            start_ts,
            state: point.consumption,
            running_sum: entry.sum,
            unit: point.unit.as_str().to_string(),
        });
    }
    rows
}

impl PostgresStatisticsSink {
    pub fn new(
        pool: PgPool,
        batch_size: usize,
        max_retries: u32,
        retry_backoff: Duration,
        flush_interval: Duration,
    ) -> Self {
        Self {
            pool,
            batch_size,
            max_retries,
            retry_backoff,
            flush_interval,
        }
    }

    /// Loads the last stored row for any statistic the in-memory state has
    /// not seen yet.
    async fn load_sum_states(
        &self,
        points: &[StatisticPoint],
        sums: &mut HashMap<String, SumState>,
    ) -> Result<(), sqlx::Error> {
        for point in points {
            if sums.contains_key(&point.statistic_id) {
                continue;
            }
            let last: Option<(OffsetDateTime, f64)> = sqlx::query_as(
                "SELECT start_ts, running_sum FROM usage_statistics \
                 WHERE statistic_id = $1 ORDER BY start_ts DESC LIMIT 1",
            )
            .bind(&point.statistic_id)
            .fetch_optional(&self.pool)
            .await?;

            let state = match last {
                Some((start_ts, sum)) => SumState {
                    last_start: Some(start_ts),
                    sum,
                },
                None => SumState::default(),
            };
            sums.insert(point.statistic_id.clone(), state);
        }
        Ok(())
    }

    async fn insert_rows(&self, rows: &[StatisticRow]) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO usage_statistics (statistic_id, start_ts, state, running_sum, unit) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(&row.statistic_id)
                .push_bind(row.start_ts)
                .push_bind(row.state)
                .push_bind(row.running_sum)
                .push_bind(&row.unit);
        });
        builder.build().execute(&self.pool).await.map(|_| ())
    }

    async fn write_points(
        &self,
        points: &[StatisticPoint],
        sums: &mut HashMap<String, SumState>,
    ) -> Result<usize, sqlx::Error> {
        self.load_sum_states(points, sums).await?;

        // Stage the sum advancement on a copy so a failed insert can be
        // retried without the running sums having already moved.
        let mut staged = sums.clone();
        let rows = rows_for_batch(points, &mut staged);
        if rows.is_empty() {
            return Ok(0);
        }

        self.insert_rows(&rows).await?;
        *sums = staged;
        Ok(rows.len())
    }

    async fn flush(
        &self,
        batch: &mut Vec<Record<StatisticPoint>>,
        sums: &mut HashMap<String, SumState>,
    ) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let points: Vec<StatisticPoint> = batch.iter().map(|r| r.payload.clone()).collect();

        let mut attempt: u32 = 0;
        loop {
            match self.write_points(&points, sums).await {
                Ok(written) => {
                    metrics::counter!("statistics_rows_written_total").increment(written as u64);
                    if let Some(oldest) = batch.iter().map(|r| r.fetched_at).min() {
                        let lag = OffsetDateTime::now_utc() - oldest;
                        metrics::histogram!("statistics_write_lag_seconds")
                            .record(lag.as_seconds_f64());
                    }
                    batch.clear();
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "statistics write failed, retrying with backoff"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "statistics write failed, giving up");
                    metrics::counter!("statistics_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(e.to_string()));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink<StatisticPoint> for PostgresStatisticsSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Record<StatisticPoint>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut buffer: Vec<Record<StatisticPoint>> = Vec::with_capacity(self.batch_size);
        let mut sums: HashMap<String, SumState> = HashMap::new();

        loop {
            // The poll source never ends, so an idle timeout flushes
            // incomplete batches between cycles.
            match tokio::time::timeout(self.flush_interval, input.next()).await {
                Err(_) => {
                    self.flush(&mut buffer, &mut sums).await?;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::error!(error = %e, "error in upstream pipeline for statistics sink");
                    continue;
                }
                Ok(Some(Ok(record))) => {
                    buffer.push(record);
                    if buffer.len() >= self.batch_size {
                        self.flush(&mut buffer, &mut sums).await?;
                    }
                }
            }
        }

        self.flush(&mut buffer, &mut sums).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};
    use tpu_client::domain::Unit;

    use super::*;

    fn point(id: &str, date: Date, consumption: f64) -> StatisticPoint {
        StatisticPoint {
            statistic_id: id.to_string(),
            date,
            consumption,
            unit: Unit::KilowattHours,
        }
    }

    #[test]
    fn first_import_gets_a_zero_baseline_before_the_first_reading() {
        let mut sums = HashMap::new();
        let points = vec![
            point("mytpu:p_1_energy", date!(2024 - 01 - 02), 10.0),
            point("mytpu:p_1_energy", date!(2024 - 01 - 03), 5.0),
        ];

        let rows = rows_for_batch(&points, &mut sums);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].start_ts, datetime!(2024 - 01 - 01 00:00 UTC));
        assert_eq!(rows[0].state, 0.0);
        assert_eq!(rows[0].running_sum, 0.0);
        assert_eq!(rows[1].start_ts, datetime!(2024 - 01 - 02 00:00 UTC));
        assert_eq!(rows[1].state, 10.0);
        assert_eq!(rows[1].running_sum, 10.0);
        assert_eq!(rows[2].running_sum, 15.0);
    }

    #[test]
    fn dates_at_or_before_the_last_import_are_skipped() {
        let mut sums = HashMap::new();
        sums.insert(
            "mytpu:p_1_energy".to_string(),
            SumState {
                last_start: Some(datetime!(2024 - 01 - 03 00:00 UTC)),
                sum: 40.0,
            },
        );
        let points = vec![
            point("mytpu:p_1_energy", date!(2024 - 01 - 02), 10.0),
            point("mytpu:p_1_energy", date!(2024 - 01 - 03), 5.0),
            point("mytpu:p_1_energy", date!(2024 - 01 - 04), 7.5),
        ];

        let rows = rows_for_batch(&points, &mut sums);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_ts, datetime!(2024 - 01 - 04 00:00 UTC));
        assert_eq!(rows[0].state, 7.5);
        assert_eq!(rows[0].running_sum, 47.5);
    }

    #[test]
    fn sums_continue_across_batches() {
        let mut sums = HashMap::new();

        let first = vec![point("mytpu:p_1_energy", date!(2024 - 01 - 02), 10.0)];
        rows_for_batch(&first, &mut sums);

        let second = vec![point("mytpu:p_1_energy", date!(2024 - 01 - 03), 2.5)];
        let rows = rows_for_batch(&second, &mut sums);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].running_sum, 12.5);
    }

    #[test]
    fn statistics_are_tracked_independently() {
        let mut sums = HashMap::new();
        let points = vec![
            point("mytpu:p_1_energy", date!(2024 - 01 - 02), 10.0),
            point("mytpu:w_2_water", date!(2024 - 01 - 02), 3.0),
        ];

        let rows = rows_for_batch(&points, &mut sums);

        // A baseline plus a data row for each statistic.
        assert_eq!(rows.len(), 4);
        let energy: Vec<_> = rows
            .iter()
            .filter(|r| r.statistic_id == "mytpu:p_1_energy")
            .collect();
        assert_eq!(energy.last().unwrap().running_sum, 10.0);
        let water: Vec<_> = rows
            .iter()
            .filter(|r| r.statistic_id == "mytpu:w_2_water")
            .collect();
        assert_eq!(water.last().unwrap().running_sum, 3.0);
    }

    #[test]
    fn unordered_input_is_accumulated_in_date_order() {
        let mut sums = HashMap::new();
        let points = vec![
            point("mytpu:p_1_energy", date!(2024 - 01 - 04), 1.0),
            point("mytpu:p_1_energy", date!(2024 - 01 - 02), 2.0),
            point("mytpu:p_1_energy", date!(2024 - 01 - 03), 4.0),
        ];

        let rows = rows_for_batch(&points, &mut sums);
        let states: Vec<f64> = rows.iter().map(|r| r.state).collect();
        let running: Vec<f64> = rows.iter().map(|r| r.running_sum).collect();

        assert_eq!(states, vec![0.0, 2.0, 4.0, 1.0]);
        assert_eq!(running, vec![0.0, 2.0, 6.0, 7.0]);
    }
}
