use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::debug;

// Utility function to measure execution time of operations
pub async fn measure_time<F, T>(operation_name: &str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    debug!("{} completed in {:.2?}", operation_name, elapsed);

    result
}

// Format a timestamp for logging
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
