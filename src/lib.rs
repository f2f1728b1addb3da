// Export all necessary modules
pub mod cache;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod database;
pub mod error;
pub mod indicators;
pub mod processor;
pub mod sources;
pub mod timeframe;
pub mod utils;

pub use error::{SourceError, StoreError, SyncError};
pub use timeframe::Timeframe;
