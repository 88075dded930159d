#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("buckets must be at least 1")]
    NoBuckets,
    #[error("bucket_size must be a positive number of seconds")]
    ZeroBucketSize,
}

/// Configuration of a shard router.
/// `buckets` and `bucket_size` must match cluster-wide, or datapoints
/// for one metric bucket will land on disagreeing aggregators.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RouterConfig {
    /// Total number of aggregators (B). Aggregators must be running with
    /// bucket numbers 0 to B-1, or routed metrics sit in queues unserved.
    pub buckets: u32,
    /// Width of each time bucket, in seconds.
    pub bucket_size: u32,
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.buckets < 1 {
            return Err(Error::NoBuckets);
        }
        if self.bucket_size < 1 {
            return Err(Error::ZeroBucketSize);
        }
        Ok(())
    }
}

/// Configuration of one aggregator out of B.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct AggregatorConfig {
    /// Which shard (0 to B-1) this aggregator owns.
    pub bucket: u32,
    /// Width of each time bucket, in seconds. Must match the routers'.
    pub bucket_size: u32,
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.bucket_size < 1 {
            return Err(Error::ZeroBucketSize);
        }
        Ok(())
    }
}
