use anyhow::Context;
use broker::{memory, topology, Consume};
use clap::Parser;
use pipeline::aggregator::{self, BucketAggregator};
use pipeline::config::{AggregatorConfig, RouterConfig};
use pipeline::generate::Generator;
use pipeline::graphite::{self, GraphiteForwarder};
use pipeline::router::ShardRouter;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Single-node runner of the metrics aggregation pipeline: shard routers,
/// bucket aggregators, and the Graphite forwarder, wired over an in-process
/// broker. Scale-out deployments run the same components as separate
/// processes against a shared broker transport.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Total number of bucket aggregators (B).
    #[arg(long, default_value = "2", env = "PIPELINE_BUCKETS")]
    buckets: u32,
    /// Width of each time bucket.
    #[arg(long, default_value = "60s", env = "PIPELINE_BUCKET_SIZE",
          value_parser = humantime::parse_duration)]
    bucket_size: std::time::Duration,
    /// Number of shard router instances sharing the ingress queue.
    #[arg(long, default_value = "1", env = "PIPELINE_ROUTERS")]
    routers: u32,
    /// Publish random demonstration metrics at this period.
    #[arg(long, env = "PIPELINE_GENERATE", value_parser = humantime::parse_duration)]
    generate: Option<std::time::Duration>,
    /// Print sink lines to stdout instead of leaving them for an external
    /// Graphite consumer.
    #[arg(long, env = "PIPELINE_PRINT_SINK")]
    print_sink: bool,
    /// Bound on the shutdown drain.
    #[arg(long, default_value = "30s", env = "PIPELINE_SHUTDOWN_TIMEOUT",
          value_parser = humantime::parse_duration)]
    shutdown_timeout: std::time::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    run(Cli::parse()).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let bucket_size =
        u32::try_from(cli.bucket_size.as_secs()).context("bucket_size is out of range")?;

    let router_config = RouterConfig {
        buckets: cli.buckets,
        bucket_size,
    };
    router_config.validate()?;

    let broker = memory::Broker::new();
    broker
        .bind(
            &topology::METRICS,
            topology::METRICS_KEY,
            topology::METRICS_KEY,
        )
        .context("failed to declare ingress topology")?;
    for shard in 0..cli.buckets {
        let key = topology::bucket_routing_key(shard);
        broker
            .bind(&topology::BUCKETS, &key, &key)
            .context("failed to declare bucket topology")?;
    }
    broker
        .bind(
            &topology::AGGREGATES,
            topology::AGGREGATES_KEY,
            topology::AGGREGATES_KEY,
        )
        .context("failed to declare aggregate topology")?;
    broker
        .declare(&topology::GRAPHITE)
        .context("failed to declare sink topology")?;

    let cancel = CancellationToken::new();
    let mut serves = Vec::new();

    for index in 0..cli.routers {
        tracing::info!(index, ?router_config, "starting shard router");
        let router = ShardRouter::new(router_config, broker.publisher(&topology::BUCKETS)?);
        serves.push(tokio::spawn(router.serve(
            broker.consume(topology::METRICS_KEY, false)?,
            cancel.clone(),
        )));
    }

    for shard in 0..cli.buckets {
        let config = AggregatorConfig {
            bucket: shard,
            bucket_size,
        };
        config.validate()?;
        tracing::info!(?config, "starting bucket aggregator");
        let aggregator = BucketAggregator::new(
            config,
            broker.publisher(&topology::AGGREGATES)?,
            aggregator::wall_clock(),
        );
        serves.push(tokio::spawn(aggregator.serve(
            broker.consume(&topology::bucket_routing_key(shard), true)?,
            cancel.clone(),
        )));
    }

    let utc_offset = graphite::local_utc_offset();
    tracing::info!(utc_offset, "starting graphite forwarder");
    let forwarder = GraphiteForwarder::new(broker.publisher(&topology::GRAPHITE)?, utc_offset);
    serves.push(tokio::spawn(forwarder.serve(
        broker.consume(topology::AGGREGATES_KEY, false)?,
        cancel.clone(),
    )));

    if let Some(period) = cli.generate {
        tracing::info!(period = ?period, "starting metrics generator");
        let generator = Generator::new(broker.publisher(&topology::METRICS)?, period);
        serves.push(tokio::spawn(generator.serve(cancel.clone())));
    }

    if cli.print_sink {
        broker.bind(&topology::GRAPHITE, "graphite.sink", "#")?;
        serves.push(tokio::spawn(print_sink(
            broker.consume("graphite.sink", false)?,
            cancel.clone(),
        )));
    }

    // Serve until signalled, then drain within the shutdown bound.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select!(
        _ = sigterm.recv() => tracing::info!("caught SIGTERM; stopping"),
        _ = sigint.recv() => tracing::info!("caught SIGINT; stopping"),
    );
    cancel.cancel();

    match tokio::time::timeout(cli.shutdown_timeout, futures::future::join_all(serves)).await {
        Ok(results) => {
            for result in results {
                result.context("component task panicked")??;
            }
        }
        Err(_) => tracing::warn!(
            timeout = ?cli.shutdown_timeout,
            "shutdown drain timed out; abandoning in-flight work"
        ),
    }
    Ok(())
}

async fn print_sink(
    mut sink: impl Consume,
    cancel: CancellationToken,
) -> Result<(), broker::Error> {
    loop {
        let delivery = tokio::select! {
            delivery = sink.next() => match delivery? {
                Some(delivery) => delivery,
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        };
        println!(
            "{} {}",
            delivery.routing_key,
            String::from_utf8_lossy(&delivery.payload)
        );
        delivery.ack();
    }
}
