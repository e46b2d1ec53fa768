use serde::{Deserialize, Serialize};

use crate::domain::reading::Unit;

/// Kind of utility service behind a meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Power,
    Water,
}

impl ServiceKind {
    /// Single-letter code the portal uses on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Power => "P",
            Self::Water => "W",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "P" => Some(Self::Power),
            "W" => Some(Self::Water),
            _ => None,
        }
    }

    /// Billing unit for readings of this kind. A reading's unit is derived
    /// from the meter kind alone, never from the response body.
    pub fn unit(&self) -> Unit {
        match self {
            Self::Power => Unit::KilowattHours,
            Self::Water => Unit::CentumCubicFeet,
        }
    }
}

/// A billable service on the account, as returned by discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Meter {
    pub meter_number: String,
    pub service_id: String,
    pub service_number: String,
    /// Device location id. The usage endpoint wants this, not the meter
    /// number, in its `meterNumber` field.
    pub device_location: String,
    pub address: Option<String>,
    pub kind: ServiceKind,
}

impl Meter {
    /// Identifier to send in the usage endpoint's `meterNumber` field.
    pub fn usage_meter_number(&self) -> &str {
        if self.device_location.is_empty() {
            &self.meter_number
        } else {
            &self.device_location
        }
    }
}
