pub mod merge;
mod store;

pub use store::{DirtyRecord, ProgressStore};
