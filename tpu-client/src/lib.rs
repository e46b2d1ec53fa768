pub mod auth;
pub mod client;
pub mod domain;
pub mod error;

pub use client::{TpuClient, DEFAULT_BASE_URL};
pub use error::{ClientError, Result};
