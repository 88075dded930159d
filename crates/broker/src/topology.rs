//! The fixed exchange topology of the metrics pipeline.
//!
//! All components agree on these declarations; the broker is expected to
//! hold them durably across restarts.

use crate::{Exchange, ExchangeKind};

/// Ingress exchange onto which producers publish raw metric datapoints.
pub const METRICS: Exchange = Exchange {
    name: "vumi.metrics",
    kind: ExchangeKind::Direct,
    durable: true,
    auto_delete: false,
};

/// Routing key (and queue name) of the ingress exchange.
pub const METRICS_KEY: &str = "vumi.metrics";

/// Exchange carrying time-bucketed datapoints, partitioned across
/// `bucket.0` .. `bucket.B-1` routing keys.
pub const BUCKETS: Exchange = Exchange {
    name: "vumi.metrics.buckets",
    kind: ExchangeKind::Direct,
    durable: true,
    auto_delete: false,
};

/// Exchange onto which aggregators publish closed-bucket aggregates.
pub const AGGREGATES: Exchange = Exchange {
    name: "vumi.metrics.aggregates",
    kind: ExchangeKind::Direct,
    durable: true,
    auto_delete: false,
};

/// Routing key (and queue name) of the aggregate exchange.
pub const AGGREGATES_KEY: &str = "vumi.metrics.aggregates";

/// Downstream sink exchange. Topic-typed: each measurement is published
/// under its metric name so consumers can subscribe to subtrees.
pub const GRAPHITE: Exchange = Exchange {
    name: "graphite",
    kind: ExchangeKind::Topic,
    durable: true,
    auto_delete: false,
};

/// Routing key (and queue name) for one shard of the bucket exchange.
/// Each aggregator is the exclusive consumer of its shard's queue.
pub fn bucket_routing_key(shard: u32) -> String {
    format!("bucket.{shard}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bucket_routing_keys() {
        assert_eq!(bucket_routing_key(0), "bucket.0");
        assert_eq!(bucket_routing_key(17), "bucket.17");
    }
}
