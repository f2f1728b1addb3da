pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresManager;
pub use store::{CandleStore, InstrumentRegistry, MarketStore, MetricStore};
