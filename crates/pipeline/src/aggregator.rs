use crate::{bucket_key, config::AggregatorConfig};
use aggregate::Aggregate;
use broker::{topology, Consume, Publish};
use std::collections::{BTreeMap, BTreeSet};
use wire::{Datapoint, MetricMessage};

/// Timesource yields the current wall clock in whole seconds since the
/// UTC epoch. Injectable so that bucket-close behavior is testable
/// without sleeping through real bucket widths.
pub type Timesource = Box<dyn Fn() -> i64 + Send + Sync>;

pub fn wall_clock() -> Timesource {
    Box::new(|| chrono::Utc::now().timestamp())
}

// Per-metric accumulation within one open bucket: the union of requested
// aggregations, and every sample observed so far.
type OpenBucket = BTreeMap<String, (BTreeSet<String>, Vec<(i64, f64)>)>;

/// BucketAggregator owns the open time buckets of one shard and is that
/// shard's sole consumer. A single task drives it, interleaving message
/// deliveries with a periodic close tick, so the bucket map is mutated
/// from exactly one place and needs no locking.
///
/// Buckets close when the wall clock enters the following bucket's window
/// plus one bucket of tolerance: a bucket for key `k` is closed by the
/// first tick observing `now_key == k + 1`, giving producers a full bucket
/// width of slack for clock skew and broker latency while bounding
/// residency to two open buckets per metric.
pub struct BucketAggregator<P> {
    config: AggregatorConfig,
    aggregates_out: P,
    now: Timesource,
    buckets: BTreeMap<i64, OpenBucket>,
    // Highest bucket key ever closed. A bucket key is emitted at most once
    // per process lifetime: anything at or below the watermark is late,
    // even when it still falls inside the close tolerance.
    watermark: i64,
}

impl<P: Publish> BucketAggregator<P> {
    pub fn new(config: AggregatorConfig, aggregates_out: P, now: Timesource) -> Self {
        Self {
            config,
            aggregates_out,
            now,
            buckets: BTreeMap::new(),
            watermark: i64::MIN,
        }
    }

    /// Fold one datapoint into its open bucket, creating the bucket on
    /// first sight. The routing stage guarantees all values of a datapoint
    /// share one time bucket, so the first value's bucket stands for all.
    pub fn observe(&mut self, point: Datapoint) {
        let Some(&(first, _)) = point.values.first() else {
            return;
        };
        let now_key = bucket_key((self.now)(), self.config.bucket_size);
        let ts_key = bucket_key(first, self.config.bucket_size);

        if ts_key < now_key - 1 || ts_key <= self.watermark {
            tracing::warn!(
                metric = point.name.as_str(),
                ts_key,
                now_key,
                "dropping late metric datapoint"
            );
            return;
        }

        let (aggregators, values) = self
            .buckets
            .entry(ts_key)
            .or_default()
            .entry(point.name)
            .or_default();
        aggregators.extend(point.aggregators);
        values.extend(point.values);
    }

    /// Close out old buckets: the bucket one behind the current wall-clock
    /// bucket is aggregated and published, anything older is dropped with
    /// a warning, and buckets at or ahead of the clock stay open.
    pub async fn close_buckets(&mut self) {
        let now_key = bucket_key((self.now)(), self.config.bucket_size);

        // Keys >= now_key remain open (including "future" keys observed
        // while a backwards clock jump is catching up).
        let open = self.buckets.split_off(&now_key);
        let closing = std::mem::replace(&mut self.buckets, open);

        for (ts_key, bucket) in closing {
            if ts_key != now_key - 1 || ts_key <= self.watermark {
                tracing::warn!(
                    ts_key,
                    now_key,
                    metrics = bucket.len(),
                    "dropping stale metric bucket"
                );
                continue;
            }
            self.watermark = ts_key;
            self.publish_bucket(ts_key, bucket).await;
        }
    }

    async fn publish_bucket(&self, ts_key: i64, bucket: OpenBucket) {
        let timestamp = ts_key * self.config.bucket_size as i64;

        for (name, (aggregators, values)) in bucket {
            for tag in &aggregators {
                let Some(aggregate) = Aggregate::from_tag(tag) else {
                    tracing::warn!(
                        metric = name.as_str(),
                        tag = tag.as_str(),
                        "skipping unknown aggregator tag"
                    );
                    continue;
                };

                let point = Datapoint {
                    name: format!("{name}.{tag}"),
                    aggregators: BTreeSet::new(),
                    values: vec![(timestamp, aggregate.apply(&values))],
                };
                if let Err(error) = self
                    .aggregates_out
                    .publish(topology::AGGREGATES_KEY, MetricMessage::from(point).encode())
                    .await
                {
                    // At-most-once emission takes precedence over delivery:
                    // the bucket is already gone, so log and move on.
                    tracing::warn!(
                        %error,
                        metric = name.as_str(),
                        tag = tag.as_str(),
                        ts_key,
                        "failed to publish aggregate"
                    );
                }
            }
        }
    }

    /// Consume this shard's subscription until cancelled, then flush.
    pub async fn serve(
        mut self,
        mut bucket_in: impl Consume,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), broker::Error> {
        let mut ticks =
            tokio::time::interval(std::time::Duration::from_secs(self.config.bucket_size as u64));
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                delivery = bucket_in.next() => {
                    let Some(delivery) = delivery? else { break };
                    match MetricMessage::decode(&delivery.payload) {
                        Ok(message) => {
                            for point in message.datapoints {
                                self.observe(point);
                            }
                            delivery.ack();
                        }
                        Err(error) => {
                            tracing::warn!(%error, "dropping undecodable bucketed metric message");
                            delivery.ack();
                        }
                    }
                }
                _ = ticks.tick() => self.close_buckets().await,
                _ = cancel.cancelled() => break,
            }
        }

        // One final close pass flushes the bucket behind the clock.
        // Buckets of the current window are intentionally abandoned.
        self.close_buckets().await;
        if !self.buckets.is_empty() {
            tracing::warn!(
                bucket = self.config.bucket,
                open = self.buckets.len(),
                "abandoning open buckets at shutdown"
            );
        }
        Ok(())
    }
}
