use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Outcome;
use crate::error::{Error, Result};
use crate::stats::{
    Accumulator, DEFAULT_BUCKETS, DEFAULT_PERCENTILES, Histogram, Peak, Rate, ResultsCounter,
    Sample, Stat, Statistic, Uniques,
};

pub const DEFAULT_SLOW_THRESHOLD_MS: u64 = 1000;
pub const DEFAULT_SUCCESS_CODES: [u16; 1] = [200];

/// Optional parameters of a collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_codes: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    /// For `header-code`: count the first capture group of this pattern instead of
    /// the raw header value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// Names a statistic to collect, with its parameters.
///
/// Deserializes from either a bare name or an object:
///
/// ```json
/// ["latency", {"name": "slow-responses", "threshold": 250}]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSpec")]
pub struct CollectorSpec {
    pub name: String,
    #[serde(flatten)]
    pub params: CollectorParams,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSpec {
    Name(String),
    Full {
        name: String,
        #[serde(flatten)]
        params: CollectorParams,
    },
}

impl From<RawSpec> for CollectorSpec {
    fn from(raw: RawSpec) -> Self {
        match raw {
            RawSpec::Name(name) => name.into(),
            RawSpec::Full { name, params } => Self { name, params },
        }
    }
}

impl From<&str> for CollectorSpec {
    fn from(name: &str) -> Self {
        name.to_string().into()
    }
}

impl From<String> for CollectorSpec {
    fn from(name: String) -> Self {
        Self {
            name,
            params: CollectorParams::default(),
        }
    }
}

/// State handed from a collector's start hook to its end hook, one per collector
/// per instrumented call.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub started: Instant,
}

impl CallContext {
    fn elapsed_ms(&self, ended: Instant) -> u64 {
        ended.saturating_duration_since(self.started).as_millis() as u64
    }
}

#[derive(Debug)]
enum Kind {
    Latency,
    ResultCodes,
    Rps,
    HeaderCode { header: String, regex: Option<Regex> },
    Concurrency { outstanding: u64 },
    RequestBytes,
    ResponseBytes,
    Uniques,
    HttpErrors { success_codes: Vec<u16> },
    SlowResponses { threshold: u64 },
}

/// Feeds one named statistic from the outcomes of instrumented calls.
///
/// Every collector keeps a cumulative statistic and, unless the kind only makes
/// sense over the whole run, an interval statistic that is cleared on every
/// monitor update. Both receive the same samples.
#[derive(Debug)]
pub struct Collector {
    name: String,
    kind: Kind,
    interval: Option<Stat>,
    cumulative: Stat,
}

impl Collector {
    pub fn from_spec(spec: &CollectorSpec) -> Result<Self> {
        let params = &spec.params;
        let (kind, stat): (Kind, Stat) = match spec.name.as_str() {
            "latency" | "runtime" => {
                let histogram = Histogram::new(
                    params.buckets.unwrap_or(DEFAULT_BUCKETS),
                    params
                        .percentiles
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PERCENTILES.to_vec()),
                );
                (Kind::Latency, histogram.into())
            }
            "result-codes" => (Kind::ResultCodes, ResultsCounter::default().into()),
            "rps" => (Kind::Rps, Rate::default().into()),
            "header-code" => {
                let header = params.header.clone().ok_or_else(|| Error::InvalidCollector {
                    name: spec.name.clone(),
                    reason: "\"header\" is required".into(),
                })?;
                let regex = params
                    .regex
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| Error::InvalidCollector {
                        name: spec.name.clone(),
                        reason: e.to_string(),
                    })?;
                (
                    Kind::HeaderCode {
                        header: header.to_lowercase(),
                        regex,
                    },
                    ResultsCounter::default().into(),
                )
            }
            "concurrency" => (Kind::Concurrency { outstanding: 0 }, Peak::default().into()),
            "request-bytes" => (Kind::RequestBytes, Accumulator::default().into()),
            "response-bytes" => (Kind::ResponseBytes, Accumulator::default().into()),
            "uniques" => (Kind::Uniques, Uniques::default().into()),
            "http-errors" => (
                Kind::HttpErrors {
                    success_codes: params
                        .success_codes
                        .clone()
                        .unwrap_or_else(|| DEFAULT_SUCCESS_CODES.to_vec()),
                },
                Accumulator::default().into(),
            ),
            "slow-responses" => (
                Kind::SlowResponses {
                    threshold: params.threshold.unwrap_or(DEFAULT_SLOW_THRESHOLD_MS),
                },
                Accumulator::default().into(),
            ),
            other => return Err(Error::UnknownStatistic(other.to_string())),
        };

        let cumulative_only = matches!(
            kind,
            Kind::Uniques | Kind::HttpErrors { .. } | Kind::SlowResponses { .. }
        );
        Ok(Self {
            name: spec.name.clone(),
            interval: (!cumulative_only).then(|| stat.empty_like()),
            cumulative: stat,
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start hook for a call starting now. Returns the context the matching end
    /// hook receives.
    pub fn start(&mut self) -> CallContext {
        self.start_at(Instant::now())
    }

    /// Start hook for a call that started at `at`.
    pub fn start_at(&mut self, at: Instant) -> CallContext {
        if let Kind::Concurrency { outstanding } = &mut self.kind {
            *outstanding += 1;
        }
        CallContext { started: at }
    }

    /// End hook for a call finishing now.
    pub fn end(&mut self, ctx: &CallContext, outcome: &Outcome) {
        self.end_at(ctx, outcome, Instant::now());
    }

    /// End hook for a call that finished at `at`.
    pub fn end_at(&mut self, ctx: &CallContext, outcome: &Outcome, at: Instant) {
        let sample = match &mut self.kind {
            Kind::Latency => Some(Sample::Value(ctx.elapsed_ms(at))),
            Kind::ResultCodes => outcome.code.map(|c| Sample::Key(c.to_string())),
            Kind::Rps => Some(Sample::Tick),
            Kind::HeaderCode { header, regex } => {
                let value = outcome.headers.get(header.as_str());
                match regex {
                    // Only a non-empty first group counts
                    Some(regex) => value
                        .and_then(|v| regex.captures(v))
                        .and_then(|c| c.get(1))
                        .filter(|m| !m.as_str().is_empty())
                        .map(|m| Sample::Key(m.as_str().to_string())),
                    None => value.map(|v| Sample::Key(v.clone())),
                }
            }
            Kind::Concurrency { outstanding } => {
                let current = *outstanding;
                *outstanding = outstanding.saturating_sub(1);
                Some(Sample::Amount(current as f64))
            }
            Kind::RequestBytes => {
                (outcome.request_bytes > 0).then(|| Sample::Amount(outcome.request_bytes as f64))
            }
            Kind::ResponseBytes => {
                (outcome.response_bytes > 0).then(|| Sample::Amount(outcome.response_bytes as f64))
            }
            Kind::Uniques => outcome.key.clone().map(Sample::Key),
            Kind::HttpErrors { success_codes } => {
                let ok = outcome.code.is_some_and(|c| success_codes.contains(&c));
                (!ok).then_some(Sample::Amount(1.0))
            }
            Kind::SlowResponses { threshold } => {
                (ctx.elapsed_ms(at) > *threshold).then_some(Sample::Amount(1.0))
            }
        };

        if let Some(sample) = sample {
            if let Some(interval) = &mut self.interval {
                interval.put(&sample);
            }
            self.cumulative.put(&sample);
        }
    }

    /// `None` for kinds collected over the whole run only.
    pub fn interval(&self) -> Option<&Stat> {
        self.interval.as_ref()
    }

    pub fn cumulative(&self) -> &Stat {
        &self.cumulative
    }

    /// Start a new interval. An interval without observations keeps running, so
    /// rates are not reset by quiet periods.
    pub fn next(&mut self) {
        if let Some(interval) = &mut self.interval
            && !interval.is_empty()
        {
            interval.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn collector(name: &str) -> Collector {
        Collector::from_spec(&name.into()).unwrap()
    }

    #[test]
    fn specs_from_names_or_objects() {
        let specs: Vec<CollectorSpec> = serde_json::from_value(json!([
            "latency",
            {"name": "http-errors", "successCodes": [200, 201]},
        ]))
        .unwrap();
        assert_eq!(specs[0].name, "latency");
        assert_eq!(specs[1].params.success_codes, Some(vec![200, 201]));
    }

    #[test]
    fn unknown_statistic_is_a_configuration_error() {
        assert!(matches!(
            Collector::from_spec(&"bogus".into()),
            Err(Error::UnknownStatistic(name)) if name == "bogus"
        ));
        assert!(matches!(
            Collector::from_spec(&"header-code".into()),
            Err(Error::InvalidCollector { .. })
        ));
    }

    #[test]
    fn cumulative_only_kinds() {
        assert!(collector("uniques").interval().is_none());
        assert!(collector("http-errors").interval().is_none());
        assert!(collector("slow-responses").interval().is_none());
        assert!(collector("latency").interval().is_some());
        assert!(collector("runtime").interval().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_and_slow_responses_time_the_call() {
        let mut latency = collector("latency");
        let mut slow = Collector::from_spec(&CollectorSpec {
            name: "slow-responses".into(),
            params: CollectorParams {
                threshold: Some(100),
                ..Default::default()
            },
        })
        .unwrap();

        let (a, b) = (latency.start(), slow.start());
        tokio::time::advance(Duration::from_millis(150)).await;
        latency.end(&a, &Outcome::ok());
        slow.end(&b, &Outcome::ok());

        assert_eq!(latency.cumulative().summary()["max"], json!(150));
        assert_eq!(slow.cumulative().summary()["total"], json!(1.0));
    }

    #[test]
    fn concurrency_tracks_outstanding_calls() {
        let mut c = collector("concurrency");
        let first = c.start();
        let second = c.start();
        let third = c.start();
        c.end(&first, &Outcome::ok());
        c.end(&second, &Outcome::ok());
        let fourth = c.start();
        c.end(&third, &Outcome::ok());
        c.end(&fourth, &Outcome::ok());
        assert_eq!(c.cumulative().summary()["max"], json!(3.0));
    }

    #[test]
    fn http_errors_count_unsuccessful_codes() {
        let mut c = collector("http-errors");
        for code in [200, 500, 404, 200] {
            let ctx = c.start();
            c.end(&ctx, &Outcome::with_code(code));
        }
        let ctx = c.start();
        c.end(&ctx, &Outcome::default());
        assert_eq!(c.cumulative().summary()["total"], json!(3.0));
    }

    #[test]
    fn next_clears_only_non_empty_intervals() {
        let mut c = collector("result-codes");
        let ctx = c.start();
        c.end(&ctx, &Outcome::with_code(200));
        c.next();
        assert!(c.interval().unwrap().is_empty());
        assert_eq!(c.cumulative().len(), 1);
    }

    #[test]
    fn header_code_reads_lowercased_header() {
        let mut c = Collector::from_spec(&CollectorSpec {
            name: "header-code".into(),
            params: CollectorParams {
                header: Some("X-Status".into()),
                ..Default::default()
            },
        })
        .unwrap();
        let mut outcome = Outcome::ok();
        outcome.headers.insert("x-status".into(), "cached".into());
        let ctx = c.start();
        c.end(&ctx, &outcome);
        assert_eq!(c.cumulative().summary()["cached"], json!(1));
    }

    #[test]
    fn header_code_keeps_first_regex_group() {
        let mut c = Collector::from_spec(&CollectorSpec {
            name: "header-code".into(),
            params: CollectorParams {
                header: Some("Content-Type".into()),
                regex: Some(r"^(\w+)/".into()),
                ..Default::default()
            },
        })
        .unwrap();
        for value in ["text/plain", "text/html", "application/json", "garbage"] {
            let mut outcome = Outcome::ok();
            outcome.headers.insert("content-type".into(), value.into());
            let ctx = c.start();
            c.end(&ctx, &outcome);
        }
        // No header at all
        let ctx = c.start();
        c.end(&ctx, &Outcome::ok());

        let summary = c.cumulative().summary();
        assert_eq!(summary["text"], json!(2));
        assert_eq!(summary["application"], json!(1));
        assert_eq!(summary["total"], json!(3));
    }

    #[test]
    fn invalid_header_regex_is_rejected() {
        let spec: CollectorSpec =
            serde_json::from_value(json!({"name": "header-code", "header": "x", "regex": "("}))
                .unwrap();
        assert_eq!(spec.params.regex.as_deref(), Some("("));
        assert!(matches!(
            Collector::from_spec(&spec),
            Err(Error::InvalidCollector { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_instants_time_the_call() {
        let mut latency = collector("latency");
        let started = Instant::now();
        tokio::time::advance(Duration::from_millis(80)).await;
        let ended = Instant::now();
        // Handled long after the call finished
        tokio::time::advance(Duration::from_secs(2)).await;

        let ctx = latency.start_at(started);
        latency.end_at(&ctx, &Outcome::ok(), ended);
        assert_eq!(latency.cumulative().summary()["max"], json!(80));
    }
}
