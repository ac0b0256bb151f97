//! One-time conversion of legacy per-course progress into per-video records.

pub mod commands;
mod engine;
mod legacy;

pub use engine::MigrationEngine;
pub use legacy::{legacy_key, parse_legacy_record, parse_legacy_value, LocalStorage, LEGACY_KEY_PREFIX};
