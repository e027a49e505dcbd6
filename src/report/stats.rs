use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::{ClassifiedFinding, OutcomeKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRow {
    pub name: String,
    pub count: u64,
    pub failures: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub requests: Vec<RequestRow>,
    pub total: RequestRow,
    pub requests_per_second: f64,
}

struct Sample {
    elapsed_ms: f64,
    failed: bool,
}

/// Aggregates the per-request detail of behavior outcomes. Rows keep the
/// order in which request names first appear.
pub fn request_stats(
    findings: &[ClassifiedFinding],
    started_at: &str,
    finished_at: Option<&str>,
) -> RequestStats {
    let mut groups: Vec<(String, Vec<Sample>)> = Vec::new();
    for finding in findings {
        if finding.outcome.kind != OutcomeKind::Behavior {
            continue;
        }
        let Some(entries) = finding.outcome.detail.get("requests").and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            let status = entry.get("status").and_then(Value::as_u64);
            let sample = Sample {
                elapsed_ms: entry.get("elapsed_ms").and_then(Value::as_f64).unwrap_or(0.0),
                failed: entry.get("error").is_some()
                    || !status.is_some_and(|s| (200..300).contains(&s)),
            };
            match groups.iter_mut().find(|(n, _)| n == name) {
                Some((_, samples)) => samples.push(sample),
                None => groups.push((name.to_string(), vec![sample])),
            }
        }
    }

    let requests: Vec<RequestRow> = groups.iter().map(|(name, s)| row(name, s)).collect();
    let all: Vec<Sample> = groups
        .into_iter()
        .flat_map(|(_, s)| s)
        .collect();
    let total = row("total", &all);
    let wall = wall_seconds(started_at, finished_at);
    let requests_per_second = if wall > 0.0 {
        round3(total.count as f64 / wall)
    } else {
        0.0
    };

    RequestStats {
        requests,
        total,
        requests_per_second,
    }
}

fn row(name: &str, samples: &[Sample]) -> RequestRow {
    let mut times: Vec<f64> = samples.iter().map(|s| s.elapsed_ms).collect();
    times.sort_by(f64::total_cmp);
    let count = times.len() as u64;
    let sum: f64 = times.iter().sum();
    RequestRow {
        name: name.to_string(),
        count,
        failures: samples.iter().filter(|s| s.failed).count() as u64,
        avg_ms: if count == 0 { 0.0 } else { round3(sum / count as f64) },
        min_ms: round3(times.first().copied().unwrap_or(0.0)),
        max_ms: round3(times.last().copied().unwrap_or(0.0)),
        p50_ms: round3(percentile(&times, 50.0)),
        p95_ms: round3(percentile(&times, 95.0)),
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn wall_seconds(started_at: &str, finished_at: Option<&str>) -> f64 {
    let parse = |s: &str| OffsetDateTime::parse(s, &Rfc3339).ok();
    match (parse(started_at), finished_at.and_then(parse)) {
        (Some(start), Some(end)) => (end - start).as_seconds_f64().max(0.0),
        _ => 0.0,
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
