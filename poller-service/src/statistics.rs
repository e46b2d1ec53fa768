use time::Date;
use tpu_client::domain::{Reading, ServiceKind, Unit};

/// One sample bound for the long-term statistics store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticPoint {
    pub statistic_id: String,
    pub date: Date,
    pub consumption: f64,
    pub unit: Unit,
}

/// Stable statistic identifier for a meter, e.g. `mytpu:p_11399586_energy`.
/// Lowercased with hyphens folded to underscores so it stays a valid
/// identifier in downstream stores.
pub fn statistic_id(kind: ServiceKind, meter_number: &str) -> String {
    let suffix = match kind {
        ServiceKind::Power => "energy",
        ServiceKind::Water => "water",
    };
    let meter = format!("{}_{}", kind.code(), meter_number)
        .to_lowercase()
        .replace('-', "_");
    format!("mytpu:{meter}_{suffix}")
}

pub fn point_for_reading(
    kind: ServiceKind,
    meter_number: &str,
    reading: &Reading,
) -> StatisticPoint {
    StatisticPoint {
        statistic_id: statistic_id(kind, meter_number),
        date: reading.date,
        consumption: reading.consumption,
        unit: reading.unit,
    }
}
