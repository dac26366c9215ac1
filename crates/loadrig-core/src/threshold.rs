use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{MetricSink, MetricSummary};

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdParseError {
    #[error("empty threshold expression")]
    Empty,
    #[error("missing comparison operator in {0:?}")]
    MissingOperator(String),
    #[error("unknown aggregate selector {0:?}")]
    UnknownSelector(String),
    #[error("percentile out of range in {0:?}")]
    PercentileOutOfRange(String),
    #[error("invalid bound in {0:?}")]
    InvalidBound(String),
}

/// Which aggregate of the metric the expression compares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selector {
    /// Quantile in `[0, 1]`; parsed from `p(95)` style percentiles.
    Quantile(f64),
    Mean,
    Min,
    Max,
    Count,
    Rate,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Quantile(q) => write!(f, "p({})", q * 100.0),
            Selector::Mean => f.write_str("mean"),
            Selector::Min => f.write_str("min"),
            Selector::Max => f.write_str("max"),
            Selector::Count => f.write_str("count"),
            Selector::Rate => f.write_str("rate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Op::Lt => observed < bound,
            Op::Le => observed <= bound,
            Op::Gt => observed > bound,
            Op::Ge => observed >= bound,
        }
    }
}

/// One parsed comparison, e.g. `p(95)<200` or `rate<0.01`.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub selector: Selector,
    pub op: Op,
    pub bound: f64,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ThresholdParseError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(ThresholdParseError::Empty);
        }

        // Two-character operators first so "<=" is never read as "<".
        let (op, pos, len) = if let Some(pos) = source.find("<=") {
            (Op::Le, pos, 2)
        } else if let Some(pos) = source.find(">=") {
            (Op::Ge, pos, 2)
        } else if let Some(pos) = source.find('<') {
            (Op::Lt, pos, 1)
        } else if let Some(pos) = source.find('>') {
            (Op::Gt, pos, 1)
        } else {
            return Err(ThresholdParseError::MissingOperator(source.to_string()));
        };

        let selector = parse_selector(source[..pos].trim(), source)?;
        let bound: f64 = source[pos + len..]
            .trim()
            .parse()
            .map_err(|_| ThresholdParseError::InvalidBound(source.to_string()))?;

        Ok(Self {
            selector,
            op,
            bound,
        })
    }

    pub fn holds(&self, observed: f64) -> bool {
        self.op.holds(observed, self.bound)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.selector, self.op.as_str(), self.bound)
    }
}

fn parse_selector(token: &str, source: &str) -> Result<Selector, ThresholdParseError> {
    if let Some(inner) = token.strip_prefix("p(").and_then(|t| t.strip_suffix(')')) {
        let pct: f64 = inner
            .trim()
            .parse()
            .map_err(|_| ThresholdParseError::UnknownSelector(token.to_string()))?;
        if !(0.0..=100.0).contains(&pct) {
            return Err(ThresholdParseError::PercentileOutOfRange(
                source.to_string(),
            ));
        }
        return Ok(Selector::Quantile(pct / 100.0));
    }
    match token {
        "mean" => Ok(Selector::Mean),
        "min" => Ok(Selector::Min),
        "max" => Ok(Selector::Max),
        "count" => Ok(Selector::Count),
        "rate" => Ok(Selector::Rate),
        other => Err(ThresholdParseError::UnknownSelector(other.to_string())),
    }
}

/// A pass/fail condition bound to one metric name.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: String,
    pub expression: Expression,
}

#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    /// Binds the configured expression strings at test start, failing fast on
    /// anything unparseable.
    pub fn from_config(
        config: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self, ThresholdParseError> {
        let mut thresholds = Vec::new();
        for (metric, sources) in config {
            for source in sources {
                thresholds.push(Threshold {
                    metric: metric.clone(),
                    expression: Expression::parse(source)?,
                });
            }
        }
        Ok(Self { thresholds })
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    /// Evaluates every threshold against the sink's current aggregates.
    ///
    /// Read-only and idempotent: repeated calls with no new samples return
    /// identical outcomes. An unknown metric, an empty metric, or a selector
    /// that does not apply to the metric's kind fails the threshold rather
    /// than erroring.
    pub fn evaluate(&self, sink: &MetricSink) -> Vec<ThresholdOutcome> {
        self.thresholds
            .iter()
            .map(|threshold| {
                let observed = observe(sink, &threshold.metric, threshold.expression.selector);
                let passed = observed.is_some_and(|value| threshold.expression.holds(value));
                ThresholdOutcome {
                    metric: threshold.metric.clone(),
                    expression: threshold.expression.to_string(),
                    observed,
                    passed,
                }
            })
            .collect()
    }
}

fn observe(sink: &MetricSink, metric: &str, selector: Selector) -> Option<f64> {
    if let Selector::Quantile(q) = selector {
        return sink.quantile(metric, q);
    }
    match (selector, sink.snapshot(metric)?) {
        (Selector::Mean, MetricSummary::Trend { count, mean, .. }) if count > 0 => Some(mean),
        (Selector::Min, MetricSummary::Trend { count, min, .. }) if count > 0 => Some(min),
        (Selector::Max, MetricSummary::Trend { count, max, .. }) if count > 0 => Some(max),
        (Selector::Count, MetricSummary::Trend { count, .. }) if count > 0 => Some(count as f64),
        (Selector::Count, MetricSummary::Counter { sum, .. }) => Some(sum),
        (Selector::Rate, MetricSummary::Rate { rate, no_data: false, .. }) => Some(rate),
        _ => None,
    }
}

/// Verdict for one threshold, including the aggregate value that decided it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    pub passed: bool,
}
