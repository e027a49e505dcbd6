mod markdown;
mod stats;
mod store;

use serde::{Deserialize, Serialize};

use crate::core::{ClassifiedFinding, Recommendation, SeveritySummary, Target};
use crate::session::{Session, SessionMode, SessionStatus, build_recommendations};

pub use markdown::render_markdown;
pub use stats::{RequestRow, RequestStats, request_stats};
pub use store::{SavedReport, save_report};

pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Serializable view of a finished session. Field names are stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredReport {
    pub session_id: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub tool_version: String,
    pub summary: SeveritySummary,
    pub targets: Vec<Target>,
    pub findings: Vec<ClassifiedFinding>,
    pub recommendations: Vec<Recommendation>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_stats: Option<RequestStats>,
}

impl StructuredReport {
    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Complete
    }
}

/// Pure transform of a session; nothing is re-queried.
pub fn to_structured_form(session: &Session) -> StructuredReport {
    let request_stats = (session.mode == SessionMode::Load).then(|| {
        request_stats(
            &session.findings,
            &session.started_at,
            session.finished_at.as_deref(),
        )
    });
    StructuredReport {
        session_id: session.id.clone(),
        mode: session.mode,
        status: session.status,
        started_at: session.started_at.clone(),
        finished_at: session.finished_at.clone(),
        tool_version: TOOL_VERSION.to_string(),
        summary: session.recompute_summary(),
        targets: session.targets.clone(),
        findings: session.findings.clone(),
        recommendations: build_recommendations(session),
        notes: session.notes.clone(),
        request_stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Detail, Outcome, OutcomeKind};
    use crate::probes::SECURITY_HEADERS;
    use serde_json::json;

    fn session() -> Session {
        let mut s = Session::start(
            SessionMode::Security,
            vec![Target::new("user-service", "http://localhost:8700", "/user-service/actuator/health")],
        )
        .expect("start");
        let mut detail = Detail::new();
        detail.insert("missing".to_string(), json!(["X-Frame-Options"]));
        s.add_outcome(Outcome::succeeded(
            OutcomeKind::Probe,
            SECURITY_HEADERS,
            "user-service",
            Some(200),
            detail,
        ))
        .expect("add");
        s.finalize(SessionStatus::Complete);
        s
    }

    #[test]
    fn structured_form_has_stable_field_names() {
        let v = serde_json::to_value(to_structured_form(&session())).expect("serialize");
        for key in [
            "sessionId",
            "mode",
            "status",
            "startedAt",
            "finishedAt",
            "toolVersion",
            "summary",
            "targets",
            "findings",
            "recommendations",
            "notes",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert!(v.get("requestStats").is_none());
        assert_eq!(v["mode"], json!("security"));
        assert_eq!(v["status"], json!("complete"));
        assert_eq!(v["summary"]["MEDIUM"], json!(1));
        assert_eq!(v["targets"][0]["baseAddress"], json!("http://localhost:8700"));
        assert_eq!(v["findings"][0]["severity"], json!("MEDIUM"));
        assert_eq!(v["findings"][0]["outcome"]["statusCode"], json!(200));
        assert_eq!(v["recommendations"][0]["affectedTargets"], json!(["user-service"]));
    }

    #[test]
    fn structured_form_is_reproducible() {
        let s = session();
        let a = serde_json::to_string(&to_structured_form(&s)).expect("a");
        let b = serde_json::to_string(&to_structured_form(&s)).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn load_sessions_carry_request_stats() {
        let mut s = Session::start(
            SessionMode::Load,
            vec![Target::new("api-gateway", "http://localhost:8080", "/actuator/health")],
        )
        .expect("start");
        s.finalize(SessionStatus::Incomplete);
        let report = to_structured_form(&s);
        assert!(!report.is_complete());
        let stats = report.request_stats.expect("stats");
        assert_eq!(stats.total.count, 0);
    }
}
