use std::fmt;

use time::Date;

/// Billing unit of a consumption reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    KilowattHours,
    CentumCubicFeet,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KilowattHours => "kWh",
            Self::CentumCubicFeet => "CCF",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One day's consumption for one meter.
///
/// Dates are the provider's local calendar days (America/Los_Angeles); no
/// timezone conversion is applied anywhere in the client. Days the portal
/// has not reported yet are simply absent, never zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub date: Date,
    pub consumption: f64,
    pub unit: Unit,
    pub meter_number: String,
    pub high_temp: Option<f64>,
    pub low_temp: Option<f64>,
}
