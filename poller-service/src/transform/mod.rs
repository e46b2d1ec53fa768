use time::macros::date;

use crate::pipeline::Validate;
use crate::statistics::StatisticPoint;

/// Pure validation of a `StatisticPoint`.
///
/// Rules:
/// - consumption must be a finite, non-negative number.
/// - the date must fall within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_point(point: &StatisticPoint) -> Result<(), String> {
    if !point.consumption.is_finite() || point.consumption < 0.0 {
        return Err(format!(
            "consumption must be a non-negative number, got {}",
            point.consumption
        ));
    }

    if point.date < date!(2000 - 01 - 01) || point.date > date!(2100 - 01 - 01) {
        return Err(format!("date {} outside the allowed window", point.date));
    }

    if point.statistic_id.is_empty() {
        return Err("empty statistic id".to_string());
    }

    Ok(())
}

#[derive(Clone, Default)]
pub struct StatisticPointValidation;

impl Validate<StatisticPoint> for StatisticPointValidation {
    fn check(&self, point: &StatisticPoint) -> Result<(), String> {
        match validate_point(point) {
            Ok(()) => Ok(()),
            Err(reason) => {
                metrics::counter!("validation_rejected_total").increment(1);
                Err(reason)
            }
        }
    }
}
