pub mod meter;
pub mod reading;

pub use meter::{Meter, ServiceKind};
pub use reading::{Reading, Unit};
