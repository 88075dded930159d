pub mod aggregator;
pub mod config;
pub mod generate;
pub mod graphite;
pub mod router;

/// Key of the time bucket containing `timestamp`, for buckets of
/// `bucket_size` whole seconds. Buckets are closed-open intervals
/// `[key * bucket_size, (key + 1) * bucket_size)`.
pub fn bucket_key(timestamp: i64, bucket_size: u32) -> i64 {
    timestamp.div_euclid(bucket_size as i64)
}
