use crate::{bucket_key, config::RouterConfig};
use broker::{topology, Consume, Publish};
use std::collections::BTreeMap;
use wire::{Datapoint, MetricMessage};

/// Stable shard of a `(metric, bucket_key)` pair: the MD5 digest of
/// `"<name>:<key>"` taken as a big-endian 128-bit integer, modulo the
/// shard count. This is a cross-language contract; routers written in
/// any language must agree on it byte for byte.
pub fn shard(name: &str, ts_key: i64, buckets: u32) -> u32 {
    let digest = md5::compute(format!("{name}:{ts_key}"));
    (u128::from_be_bytes(digest.0) % buckets as u128) as u32
}

/// ShardRouter consumes raw metric messages from the ingress exchange and
/// republishes their datapoints onto the bucket exchange, partitioned by
/// `(metric, time bucket)`. It keeps no state beyond its broker handles:
/// any number of instances may run, restart, or die without coordination.
pub struct ShardRouter<P> {
    config: RouterConfig,
    buckets_out: P,
}

impl<P: Publish> ShardRouter<P> {
    pub fn new(config: RouterConfig, buckets_out: P) -> Self {
        Self {
            config,
            buckets_out,
        }
    }

    /// Split a metric message into one output message per
    /// `(metric, bucket_key)` group, keyed by that group's shard.
    /// Two values of one datapoint falling into different time buckets
    /// produce two output messages.
    fn split(&self, message: &MetricMessage) -> Vec<(String, MetricMessage)> {
        let mut out = Vec::new();

        for point in &message.datapoints {
            let mut groups: BTreeMap<i64, Vec<(i64, f64)>> = BTreeMap::new();
            for &(timestamp, value) in &point.values {
                groups
                    .entry(bucket_key(timestamp, self.config.bucket_size))
                    .or_default()
                    .push((timestamp, value));
            }

            for (ts_key, values) in groups {
                let shard = shard(&point.name, ts_key, self.config.buckets);
                out.push((
                    topology::bucket_routing_key(shard),
                    MetricMessage::from(Datapoint {
                        name: point.name.clone(),
                        aggregators: point.aggregators.clone(),
                        values,
                    }),
                ));
            }
        }
        out
    }

    /// Consume the ingress subscription until cancelled.
    pub async fn serve(
        self,
        mut metrics_in: impl Consume,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), broker::Error> {
        loop {
            let delivery = tokio::select! {
                delivery = metrics_in.next() => match delivery? {
                    Some(delivery) => delivery,
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            };

            let message = match MetricMessage::decode(&delivery.payload) {
                Ok(message) => message,
                Err(error) => {
                    // Poison message: acknowledged so it is never requeued.
                    tracing::warn!(%error, "dropping undecodable metric message");
                    delivery.ack();
                    continue;
                }
            };

            let mut failed = false;
            for (routing_key, message) in self.split(&message) {
                if let Err(error) = self
                    .buckets_out
                    .publish(&routing_key, message.encode())
                    .await
                {
                    tracing::warn!(
                        %error,
                        %routing_key,
                        "failed to publish bucketed metrics; requeueing input"
                    );
                    failed = true;
                    break;
                }
            }
            if failed {
                delivery.nack();
            } else {
                delivery.ack();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn router(buckets: u32, bucket_size: u32) -> ShardRouter<NullPublisher> {
        ShardRouter::new(
            RouterConfig {
                buckets,
                bucket_size,
            },
            NullPublisher,
        )
    }

    struct NullPublisher;

    #[async_trait::async_trait]
    impl Publish for NullPublisher {
        async fn publish(&self, _: &str, _: bytes::Bytes) -> Result<(), broker::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_shard_reference_values() {
        // md5("foo.bar:17") == 735c65171a3514661d9d2608bbb32ee6; the shard
        // is that digest, big-endian, modulo the shard count. These values
        // pin the cross-language contract.
        assert_eq!(shard("foo.bar", 17, 4), 2);
        assert_eq!(shard("foo.bar", 17, 8), 6);
        assert_eq!(shard("foo.bar", 17, 3), 2);

        assert_eq!(shard("vumi.random.count", 20, 4), 1);
        assert_eq!(shard("vumi.random.count", 21, 4), 1);

        // One shard takes everything.
        for (name, ts_key) in [("a", 1), ("b", 2), ("c.d.e", 300)] {
            assert_eq!(shard(name, ts_key, 1), 0);
        }
    }

    #[test]
    fn test_split_groups_by_time_bucket() {
        let router = router(4, 5);
        let message = MetricMessage::from(Datapoint::new(
            "vumi.random.count",
            ["sum"],
            vec![(100, 1.0), (102, 1.0), (105, 1.0)],
        ));

        // Values at 100 and 102 share bucket 20; 105 opens bucket 21.
        let split = router.split(&message);
        assert_eq!(
            split,
            vec![
                (
                    "bucket.1".to_string(),
                    MetricMessage::from(Datapoint::new(
                        "vumi.random.count",
                        ["sum"],
                        vec![(100, 1.0), (102, 1.0)],
                    )),
                ),
                (
                    "bucket.1".to_string(),
                    MetricMessage::from(Datapoint::new(
                        "vumi.random.count",
                        ["sum"],
                        vec![(105, 1.0)],
                    )),
                ),
            ]
        );
    }

    #[test]
    fn test_split_multiple_datapoints() {
        let router = router(1, 5);
        let message = MetricMessage::new(vec![
            Datapoint::new("a.metric", ["sum"], vec![(10, 1.0)]),
            Datapoint::new("other.metric", ["max"], vec![(11, 2.0)]),
        ]);

        let split = router.split(&message);
        assert_eq!(split.len(), 2);
        // With one bucket everything routes to bucket.0.
        assert!(split.iter().all(|(key, _)| key == "bucket.0"));
        assert_eq!(split[0].1.datapoints[0].name, "a.metric");
        assert_eq!(split[1].1.datapoints[0].name, "other.metric");
    }

    #[tokio::test]
    async fn test_serve_routes_and_drops_poison() {
        let broker = broker::memory::Broker::new();
        broker
            .bind(
                &topology::METRICS,
                topology::METRICS_KEY,
                topology::METRICS_KEY,
            )
            .unwrap();
        broker.bind(&topology::BUCKETS, "bucket.0", "bucket.0").unwrap();

        let metrics_out = broker.publisher(&topology::METRICS).unwrap();
        metrics_out
            .publish(topology::METRICS_KEY, bytes::Bytes::from_static(b"junk"))
            .await
            .unwrap();
        let message = MetricMessage::from(Datapoint::new("a.metric", ["sum"], vec![(10, 1.0)]));
        metrics_out
            .publish(topology::METRICS_KEY, message.encode())
            .await
            .unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let router = ShardRouter::new(
            RouterConfig {
                buckets: 1,
                bucket_size: 5,
            },
            broker.publisher(&topology::BUCKETS).unwrap(),
        );
        let serve = tokio::spawn(router.serve(
            broker.consume(topology::METRICS_KEY, false).unwrap(),
            cancel.clone(),
        ));

        // The poison message is dropped; the valid one arrives on its shard.
        let mut bucket0 = broker.consume("bucket.0", true).unwrap();
        let delivery = bucket0.next().await.unwrap().unwrap();
        assert_eq!(MetricMessage::decode(&delivery.payload).unwrap(), message);
        delivery.ack();

        cancel.cancel();
        serve.await.unwrap().unwrap();
    }
}
