use broker::{Consume, Publish};
use wire::MetricMessage;

/// Seconds east of UTC for the host timezone.
pub fn local_utc_offset() -> i32 {
    chrono::Local::now().offset().local_minus_utc()
}

/// GraphiteForwarder translates closed-bucket aggregates into Graphite's
/// plaintext form and publishes each measurement under its metric name,
/// so downstream consumers can subscribe to metric subtrees. It keeps no
/// state and any number of instances may run.
pub struct GraphiteForwarder<P> {
    graphite_out: P,
    // Graphite historically consumes local-time timestamps; the offset is
    // sampled once at startup and subtracted from every UTC timestamp.
    utc_offset: i32,
}

impl<P: Publish> GraphiteForwarder<P> {
    pub fn new(graphite_out: P, utc_offset: i32) -> Self {
        Self {
            graphite_out,
            utc_offset,
        }
    }

    fn line(&self, timestamp: i64, value: f64) -> String {
        format!("{:.6} {}", value, timestamp - self.utc_offset as i64)
    }

    /// Consume the aggregate subscription until cancelled.
    pub async fn serve(
        self,
        mut aggregates_in: impl Consume,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), broker::Error> {
        loop {
            let delivery = tokio::select! {
                delivery = aggregates_in.next() => match delivery? {
                    Some(delivery) => delivery,
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            };

            let message = match MetricMessage::decode(&delivery.payload) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(%error, "dropping undecodable aggregate message");
                    delivery.ack();
                    continue;
                }
            };

            let mut failed = false;
            'publish: for point in &message.datapoints {
                for &(timestamp, value) in &point.values {
                    let line = self.line(timestamp, value);
                    if let Err(error) =
                        self.graphite_out.publish(&point.name, line.into()).await
                    {
                        tracing::warn!(
                            %error,
                            metric = point.name.as_str(),
                            "failed to publish to graphite; requeueing aggregate"
                        );
                        failed = true;
                        break 'publish;
                    }
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
