use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::stats::Summary;

/// Aggregate metrics a threshold can be written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Metric {
    AverageDuration,
    P95Duration,
    CheckPassRate,
}

impl Metric {
    fn parse(name: &str) -> Option<Metric> {
        match name {
            "average_duration" => Some(Metric::AverageDuration),
            "p95_duration" => Some(Metric::P95Duration),
            "check_pass_rate" => Some(Metric::CheckPassRate),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Metric::AverageDuration => "average_duration",
            Metric::P95Duration => "p95_duration",
            Metric::CheckPassRate => "check_pass_rate",
        }
    }

    /// Duration metrics carry millisecond bounds; the pass rate is a bare ratio.
    fn is_duration(&self) -> bool {
        matches!(self, Metric::AverageDuration | Metric::P95Duration)
    }

    fn observe(&self, summary: &Summary) -> f64 {
        match self {
            Metric::AverageDuration => summary.average_duration_ms,
            Metric::P95Duration => summary.p95_duration_ms,
            Metric::CheckPassRate => summary.check_pass_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn parse(symbol: &str) -> Option<Comparison> {
        match symbol {
            "<" => Some(Comparison::Lt),
            "<=" => Some(Comparison::Le),
            ">" => Some(Comparison::Gt),
            ">=" => Some(Comparison::Ge),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }

    fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
        }
    }
}

/// One pass/fail condition over an end-of-run aggregate, e.g. `p95_duration < 1000ms`.
/// Duration bounds are normalized to milliseconds at parse time.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric: Metric,
    pub comparison: Comparison,
    pub bound: f64,
}

impl ThresholdSpec {
    pub fn expression(&self) -> String {
        if self.metric.is_duration() {
            format!("{}{}ms", self.comparison.symbol(), self.bound)
        } else {
            format!("{}{}", self.comparison.symbol(), self.bound)
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("unknown threshold metric '{0}'")]
    UnknownMetric(String),
    #[error("malformed threshold expression '{expr}' for metric '{metric}'")]
    BadExpression { metric: String, expr: String },
    #[error("unit '{unit}' is not valid for metric '{metric}'")]
    BadUnit { metric: String, unit: String },
}

lazy_static! {
    static ref EXPR_RE: Regex =
        Regex::new(r"^\s*(<=|>=|<|>)\s*([0-9]+(?:\.[0-9]+)?)\s*([a-z]*)\s*$").unwrap();
}

/// Parses the `metric -> expressions` map from the configuration into specs,
/// ordered deterministically for reporting.
pub fn parse_specs(raw: &HashMap<String, Vec<String>>) -> Result<Vec<ThresholdSpec>, ThresholdError> {
    let mut specs = Vec::new();
    for (name, exprs) in raw {
        let metric =
            Metric::parse(name).ok_or_else(|| ThresholdError::UnknownMetric(name.clone()))?;
        for expr in exprs {
            specs.push(parse_expr(metric, name, expr)?);
        }
    }
    specs.sort_by(|a, b| (a.metric.key(), a.expression()).cmp(&(b.metric.key(), b.expression())));
    Ok(specs)
}

fn parse_expr(metric: Metric, name: &str, expr: &str) -> Result<ThresholdSpec, ThresholdError> {
    let bad = || ThresholdError::BadExpression {
        metric: name.to_string(),
        expr: expr.to_string(),
    };
    let captures = EXPR_RE.captures(expr).ok_or_else(bad)?;

    let comparison = Comparison::parse(&captures[1]).ok_or_else(bad)?;
    let value: f64 = captures[2].parse().map_err(|_| bad())?;
    let unit = &captures[3];

    let bound = match (metric.is_duration(), unit) {
        (true, "" | "ms") => value,
        (true, "s") => value * 1000.0,
        (false, "") => value,
        _ => {
            return Err(ThresholdError::BadUnit {
                metric: name.to_string(),
                unit: unit.to_string(),
            })
        }
    };

    Ok(ThresholdSpec {
        metric,
        comparison,
        bound,
    })
}

/// The outcome of checking one threshold against the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdReport {
    pub metric: &'static str,
    pub expression: String,
    pub observed: f64,
    pub passed: bool,
}

pub fn evaluate(specs: &[ThresholdSpec], summary: &Summary) -> Vec<ThresholdReport> {
    specs
        .iter()
        .map(|spec| {
            let observed = spec.metric.observe(summary);
            ThresholdReport {
                metric: spec.metric.key(),
                expression: spec.expression(),
                observed,
                passed: spec.comparison.holds(observed, spec.bound),
            }
        })
        .collect()
}

/// The run's overall verdict: the logical AND of every threshold evaluation.
pub fn verdict(reports: &[ThresholdReport]) -> bool {
    reports.iter().all(|report| report.passed)
}
