pub mod cadence;
pub mod symbols;

pub use cadence::UpdateCadenceState;
pub use symbols::{SymbolAvailabilityCache, SymbolSnapshot};
