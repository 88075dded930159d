use broker::{topology, Publish};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use wire::{Datapoint, MetricMessage};

/// Generator publishes a small set of random metrics onto the ingress
/// exchange each period: a coin-flip counter, a gauge around a normal
/// distribution, and a uniform timer. Useful for demonstrations and for
/// smoke-testing a deployed topology end to end.
pub struct Generator<P> {
    metrics_out: P,
    period: std::time::Duration,
    rng: SmallRng,
}

impl<P: Publish> Generator<P> {
    pub fn new(metrics_out: P, period: std::time::Duration) -> Self {
        Self {
            metrics_out,
            period,
            rng: SmallRng::from_entropy(),
        }
    }

    fn sample(&mut self, now: i64) -> MetricMessage {
        let normal = Normal::new(2.0, 0.1).expect("distribution parameters are valid");

        MetricMessage::new(vec![
            Datapoint::new(
                "vumi.random.count",
                ["sum"],
                vec![(now, if self.rng.gen::<bool>() { 1.0 } else { 0.0 })],
            ),
            Datapoint::new(
                "vumi.random.value",
                ["avg"],
                vec![(now, normal.sample(&mut self.rng))],
            ),
            Datapoint::new(
                "vumi.random.timer",
                ["avg", "p95", "p99"],
                vec![(now, self.rng.gen_range(0.0..0.1))],
            ),
        ])
    }

    /// Publish a batch of random metrics each period until cancelled.
    pub async fn serve(
        mut self,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), broker::Error> {
        let mut ticks = tokio::time::interval(self.period);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    let message = self.sample(chrono::Utc::now().timestamp());
                    if let Err(error) = self
                        .metrics_out
                        .publish(topology::METRICS_KEY, message.encode())
                        .await
                    {
                        tracing::warn!(%error, "failed to publish generated metrics");
                    }
                }
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}
