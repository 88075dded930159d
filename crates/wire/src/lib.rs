use std::collections::BTreeSet;

/// Version tag of the metric message envelope. Decoding rejects any other
/// version rather than guessing at field semantics.
pub const VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid metric message encoding")]
    Json(#[from] serde_json::Error),
    #[error("unsupported metric message version {0} (expected {VERSION})")]
    UnsupportedVersion(u32),
    #[error("metric datapoint has an empty name")]
    EmptyName,
    #[error("metric datapoint {0:?} has no values")]
    EmptyValues(String),
}

/// Datapoint is one metric observation: a dot-separated metric name, the set
/// of aggregations requested for it, and one or more `(timestamp, value)`
/// samples. Timestamps are whole seconds since the UTC epoch.
///
/// The aggregator set may be empty for values which are already aggregated
/// and are passing through a later pipeline stage unchanged.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Datapoint {
    pub name: String,
    pub aggregators: BTreeSet<String>,
    pub values: Vec<(i64, f64)>,
}

impl Datapoint {
    pub fn new<N, A>(name: N, aggregators: A, values: Vec<(i64, f64)>) -> Self
    where
        N: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            name: name.into(),
            aggregators: aggregators.into_iter().map(Into::into).collect(),
            values,
        }
    }
}

/// MetricMessage is the wire envelope carrying one or more Datapoints.
/// A message is the atomic unit of broker delivery: if any part of it fails
/// to decode or validate, the whole message is rejected.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricMessage {
    pub datapoints: Vec<Datapoint>,
}

// Envelope is the self-describing serialized form of a MetricMessage.
#[derive(serde::Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    datapoints: &'a [Datapoint],
}

#[derive(serde::Deserialize)]
struct Envelope {
    version: u32,
    datapoints: Vec<Datapoint>,
}

impl MetricMessage {
    pub fn new(datapoints: Vec<Datapoint>) -> Self {
        Self { datapoints }
    }

    /// Encode into the versioned JSON envelope.
    pub fn encode(&self) -> bytes::Bytes {
        let env = EnvelopeRef {
            version: VERSION,
            datapoints: &self.datapoints,
        };
        // Serialization of these plain data types cannot fail.
        serde_json::to_vec(&env)
            .expect("MetricMessage always serializes")
            .into()
    }

    /// Decode and validate a received envelope.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let Envelope {
            version,
            datapoints,
        } = serde_json::from_slice(payload)?;

        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        for point in &datapoints {
            if point.name.is_empty() {
                return Err(Error::EmptyName);
            }
            if point.values.is_empty() {
                return Err(Error::EmptyValues(point.name.clone()));
            }
        }
        Ok(Self { datapoints })
    }
}

impl From<Datapoint> for MetricMessage {
    fn from(point: Datapoint) -> Self {
        Self {
            datapoints: vec![point],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> MetricMessage {
        MetricMessage::new(vec![
            Datapoint::new(
                "vumi.random.count",
                ["sum", "count"],
                vec![(100, 1.0), (102, 2.5)],
            ),
            Datapoint::new("vumi.random.value.avg", [] as [&str; 0], vec![(105, 2.0)]),
        ])
    }

    #[test]
    fn test_encoding_fixture() {
        let encoded = fixture().encode();

        insta::assert_snapshot!(String::from_utf8_lossy(&encoded), @r###"{"version":1,"datapoints":[{"name":"vumi.random.count","aggregators":["count","sum"],"values":[[100,1.0],[102,2.5]]},{"name":"vumi.random.value.avg","aggregators":[],"values":[[105,2.0]]}]}"###);
    }

    #[test]
    fn test_round_trip() {
        let msg = fixture();
        let decoded = MetricMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_decode_failure_cases() {
        let case = |payload: &str| MetricMessage::decode(payload.as_bytes()).unwrap_err();

        // Not JSON at all.
        assert!(matches!(case("nope"), Error::Json(_)));
        // Missing envelope fields.
        assert!(matches!(case(r#"{"version":1}"#), Error::Json(_)));
        // A version from the future.
        assert!(matches!(
            case(r#"{"version":2,"datapoints":[]}"#),
            Error::UnsupportedVersion(2)
        ));
        // An empty metric name fails the whole message.
        let err = case(
            r#"{"version":1,"datapoints":[
                {"name":"ok.metric","aggregators":["sum"],"values":[[1,1.0]]},
                {"name":"","aggregators":[],"values":[[1,1.0]]}]}"#,
        );
        assert!(matches!(err, Error::EmptyName));
        // So does a datapoint without values.
        let err = case(
            r#"{"version":1,"datapoints":[
                {"name":"ok.metric","aggregators":[],"values":[]}]}"#,
        );
        assert!(matches!(err, Error::EmptyValues(name) if name == "ok.metric"));
    }

    #[test]
    fn test_aggregator_sets_deduplicate() {
        let decoded = MetricMessage::decode(
            br#"{"version":1,"datapoints":[
                {"name":"m","aggregators":["sum","sum","max"],"values":[[1,1.0]]}]}"#,
        )
        .unwrap();

        let tags: Vec<&str> = decoded.datapoints[0]
            .aggregators
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(tags, vec!["max", "sum"]);
    }
}
