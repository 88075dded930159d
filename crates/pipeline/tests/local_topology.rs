//! End-to-end run of the pipeline over the in-process broker:
//! ingress -> shard routers -> aggregators -> graphite forwarder -> sink.

use broker::{memory, topology, Consume, Publish};
use pipeline::aggregator::BucketAggregator;
use pipeline::config::{AggregatorConfig, RouterConfig};
use pipeline::graphite::GraphiteForwarder;
use pipeline::router::ShardRouter;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wire::{Datapoint, MetricMessage};

const BUCKETS: u32 = 2;
const BUCKET_SIZE: u32 = 5;

#[tokio::test(start_paused = true)]
async fn test_pipeline_end_to_end() {
    let broker = memory::Broker::new();
    broker
        .bind(
            &topology::METRICS,
            topology::METRICS_KEY,
            topology::METRICS_KEY,
        )
        .unwrap();
    for shard in 0..BUCKETS {
        let key = topology::bucket_routing_key(shard);
        broker.bind(&topology::BUCKETS, &key, &key).unwrap();
    }
    broker
        .bind(
            &topology::AGGREGATES,
            topology::AGGREGATES_KEY,
            topology::AGGREGATES_KEY,
        )
        .unwrap();
    broker.bind(&topology::GRAPHITE, "sink", "#").unwrap();

    let cancel = CancellationToken::new();
    let clock = Arc::new(AtomicI64::new(104));
    let mut serves = Vec::new();

    // Two stateless routers sharing the ingress queue.
    for _ in 0..2 {
        let router = ShardRouter::new(
            RouterConfig {
                buckets: BUCKETS,
                bucket_size: BUCKET_SIZE,
            },
            broker.publisher(&topology::BUCKETS).unwrap(),
        );
        serves.push(tokio::spawn(router.serve(
            broker.consume(topology::METRICS_KEY, false).unwrap(),
            cancel.clone(),
        )));
    }

    // One aggregator per shard, driven by a shared manual clock.
    for shard in 0..BUCKETS {
        let reader = clock.clone();
        let aggregator = BucketAggregator::new(
            AggregatorConfig {
                bucket: shard,
                bucket_size: BUCKET_SIZE,
            },
            broker.publisher(&topology::AGGREGATES).unwrap(),
            Box::new(move || reader.load(Ordering::SeqCst)),
        );
        serves.push(tokio::spawn(aggregator.serve(
            broker
                .consume(&topology::bucket_routing_key(shard), true)
                .unwrap(),
            cancel.clone(),
        )));
    }

    let forwarder = GraphiteForwarder::new(broker.publisher(&topology::GRAPHITE).unwrap(), 0);
    serves.push(tokio::spawn(forwarder.serve(
        broker.consume(topology::AGGREGATES_KEY, false).unwrap(),
        cancel.clone(),
    )));

    // A producer publishes two metrics, all samples in time bucket 20.
    let producer = broker.publisher(&topology::METRICS).unwrap();
    producer
        .publish(
            topology::METRICS_KEY,
            MetricMessage::new(vec![
                Datapoint::new(
                    "requests.count",
                    ["sum", "count"],
                    vec![(100, 1.0), (102, 1.0), (103, 1.0)],
                ),
                Datapoint::new(
                    "response.time",
                    ["avg", "max"],
                    vec![(101, 10.0), (104, 30.0)],
                ),
            ])
            .encode(),
        )
        .await
        .unwrap();

    // Let routing and accumulation drain, then step the wall clock into
    // bucket 21 so the aggregators' next tick closes bucket 20.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    clock.store(106, Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_secs(BUCKET_SIZE as u64)).await;

    // Both metrics hash onto shard 1, and one aggregator's emission order
    // is deterministic: metrics, then tags, in lexicographic order.
    let mut sink = broker.consume("sink", false).unwrap();
    let mut lines = Vec::new();
    for _ in 0..4 {
        let delivery = sink.next().await.unwrap().unwrap();
        lines.push((
            delivery.routing_key.clone(),
            String::from_utf8_lossy(&delivery.payload).into_owned(),
        ));
        delivery.ack();
    }

    assert_eq!(
        lines,
        vec![
            ("requests.count.count".to_string(), "3.000000 100".to_string()),
            ("requests.count.sum".to_string(), "3.000000 100".to_string()),
            ("response.time.avg".to_string(), "20.000000 100".to_string()),
            ("response.time.max".to_string(), "30.000000 100".to_string()),
        ]
    );

    // Shut the whole topology down; every serve loop drains cleanly.
    cancel.cancel();
    for serve in serves {
        serve.await.unwrap().unwrap();
    }
}
