pub mod error;
pub mod models;
pub mod store;

pub use error::{HistoryError, HistoryResult};
pub use models::{RunComparison, RunFilter, SweepRunRecord, ValueDelta};
pub use store::{SqliteSweepStore, SqliteSweepStoreBuilder};
