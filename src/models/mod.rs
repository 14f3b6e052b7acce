//! Data models for carhive.

mod record;

pub use record::{contains_listing, DetailSpec, VehicleRecord, PRICE_UNKNOWN};
