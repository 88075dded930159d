/// Aggregate is one of the closed set of reductions a bucket of metric values
/// may request by tag. Tags outside this set are data, not errors: lookups
/// return `None` and callers skip the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Aggregate {
    Sum,
    Count,
    Min,
    Max,
    Avg,
    StdDev,
    P50,
    P95,
    P99,
}

impl Aggregate {
    /// Look up an aggregate by its wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "avg" => Some(Self::Avg),
            "stddev" => Some(Self::StdDev),
            "p50" => Some(Self::P50),
            "p95" => Some(Self::P95),
            "p99" => Some(Self::P99),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::StdDev => "stddev",
            Self::P50 => "p50",
            Self::P95 => "p95",
            Self::P99 => "p99",
        }
    }

    /// Reduce a non-empty bucket of `(timestamp, value)` samples.
    pub fn apply(&self, values: &[(i64, f64)]) -> f64 {
        debug_assert!(!values.is_empty());

        match self {
            Self::Sum => values.iter().map(|(_, v)| v).sum(),
            Self::Count => values.len() as f64,
            Self::Min => values.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min),
            Self::Max => values
                .iter()
                .map(|(_, v)| *v)
                .fold(f64::NEG_INFINITY, f64::max),
            Self::Avg => {
                values.iter().map(|(_, v)| v).sum::<f64>() / values.len() as f64
            }
            Self::StdDev => {
                // Population standard deviation.
                let mean = values.iter().map(|(_, v)| v).sum::<f64>() / values.len() as f64;
                let variance = values
                    .iter()
                    .map(|(_, v)| (v - mean) * (v - mean))
                    .sum::<f64>()
                    / values.len() as f64;
                variance.sqrt()
            }
            Self::P50 => percentile(values, 50.0),
            Self::P95 => percentile(values, 95.0),
            Self::P99 => percentile(values, 99.0),
        }
    }
}

// Linearly interpolated percentile over the sorted values:
// rank r = p/100 * (n-1), interpolating between the values at
// floor(r) and ceil(r). This matches the interpolation used by
// downstream dashboards and is fixed cluster-wide.
fn percentile(values: &[(i64, f64)], p: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().map(|(_, v)| *v).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let fraction = rank - rank.floor();

    if lower + 1 < sorted.len() {
        sorted[lower] + fraction * (sorted[lower + 1] - sorted[lower])
    } else {
        sorted[lower]
    }
}
