pub mod dma;

// Re-export the DMA engine
pub use self::dma::{compute_dma, DmaEngine, DmaSpec, DEFAULT_DMA_SPECS};
