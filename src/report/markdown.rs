use std::fmt::Write as _;

use super::StructuredReport;
use crate::core::Severity;
use crate::session::SessionStatus;

pub fn render_markdown(report: &StructuredReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# svcprobe {} report", report.mode);
    let _ = writeln!(out);
    let _ = writeln!(out, "- session: `{}`", report.session_id);
    let _ = writeln!(out, "- tool version: {}", report.tool_version);
    let _ = writeln!(out, "- started: {}", report.started_at);
    if let Some(finished) = &report.finished_at {
        let _ = writeln!(out, "- finished: {finished}");
    }
    let status = match report.status {
        SessionStatus::Complete => "complete",
        SessionStatus::Incomplete => "**incomplete** (interrupted, partial results)",
        SessionStatus::Running => "running",
    };
    let _ = writeln!(out, "- status: {status}");
    for note in &report.notes {
        let _ = writeln!(out, "- note: {note}");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Summary");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Severity | Count |");
    let _ = writeln!(out, "|---|---:|");
    for severity in Severity::ALL_DESC {
        let _ = writeln!(out, "| {severity} | {} |", report.summary.count(severity));
    }
    let _ = writeln!(out, "| total | {} |", report.summary.total);

    let _ = writeln!(out);
    let _ = writeln!(out, "## Targets ({})", report.targets.len());
    let _ = writeln!(out);
    for t in &report.targets {
        let _ = writeln!(out, "- `{}`: {}{}", t.id, t.base_address, t.liveness_path);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Recommendations ({})", report.recommendations.len());
    if report.recommendations.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "_No recommendations._");
    }
    for (i, rec) in report.recommendations.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}. **[{}] {}**: {}", i + 1, rec.severity, rec.category, rec.message);
        let targets: Vec<String> = rec.affected_targets.iter().map(|t| format!("`{t}`")).collect();
        let _ = writeln!(out, "   - affected: {}", targets.join(", "));
    }

    let notable: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.severity != Severity::Info)
        .collect();
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "## Findings ({} of {}, INFO omitted)",
        notable.len(),
        report.findings.len()
    );
    if !notable.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "| Severity | Category | Target | Check | Error |");
        let _ = writeln!(out, "|---|---|---|---|---|");
        for f in notable {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                f.severity,
                f.category,
                f.outcome.target,
                f.outcome.name,
                escape_cell(f.outcome.error.as_deref().unwrap_or("")),
            );
        }
    }

    if let Some(stats) = &report.request_stats {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Requests ({:.2} req/s)", stats.requests_per_second);
        let _ = writeln!(out);
        let _ = writeln!(out, "| Name | Count | Failures | Avg ms | Min ms | Max ms | p50 ms | p95 ms |");
        let _ = writeln!(out, "|---|---:|---:|---:|---:|---:|---:|---:|");
        for row in stats.requests.iter().chain(std::iter::once(&stats.total)) {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {:.1} | {:.1} | {:.1} | {:.1} | {:.1} |",
                row.name,
                row.count,
                row.failures,
                row.avg_ms,
                row.min_ms,
                row.max_ms,
                row.p50_ms,
                row.p95_ms
            );
        }
    }

    out
}

fn escape_cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailureKind, Outcome, OutcomeKind, Target};
    use crate::report::to_structured_form;
    use crate::session::{Session, SessionMode};

    #[test]
    fn renders_summary_recommendations_and_incomplete_marker() {
        let mut s = Session::start(
            SessionMode::Security,
            vec![Target::new("order-service", "http://localhost:8300", "/order-service/actuator/health")],
        )
        .expect("start");
        s.add_outcome(Outcome::failed(
            OutcomeKind::Probe,
            "http_methods",
            "order-service",
            FailureKind::Transport,
            "connection failed: a|b",
        ))
        .expect("add");
        s.finalize(SessionStatus::Incomplete);
        let md = render_markdown(&to_structured_form(&s));

        assert!(md.starts_with("# svcprobe security report\n"));
        assert!(md.contains("- status: **incomplete**"));
        assert!(md.contains("| LOW | 1 |"));
        assert!(md.contains("| total | 1 |"));
        assert!(md.contains("**[LOW] TRANSPORT_ERRORS**"));
        assert!(md.contains("connection failed: a\\|b"));
        assert!(!md.contains("## Requests"));
    }
}
