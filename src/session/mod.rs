mod cancel;
mod error;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::Mutex;

use crate::core::{
    ClassifiedFinding, Outcome, Recommendation, SeveritySummary, Target, now_rfc3339,
};

pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Security,
    Load,
}

impl SessionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionMode::Security => "security",
            SessionMode::Load => "load",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: SessionStatus,
    pub targets: Vec<Target>,
    pub findings: Vec<ClassifiedFinding>,
    pub summary: SeveritySummary,
    pub notes: Vec<String>,
}

impl Session {
    pub fn start(mode: SessionMode, targets: Vec<Target>) -> Result<Self, SessionError> {
        if targets.is_empty() {
            return Err(SessionError::configuration("ターゲットが 1 件もありません"));
        }
        Ok(Self {
            id: next_session_id(mode),
            mode,
            started_at: now_rfc3339(),
            finished_at: None,
            status: SessionStatus::Running,
            targets,
            findings: Vec::new(),
            summary: SeveritySummary::default(),
            notes: Vec::new(),
        })
    }

    pub fn is_finalized(&self) -> bool {
        self.status != SessionStatus::Running
    }

    pub fn add_outcome(&mut self, outcome: Outcome) -> Result<&ClassifiedFinding, SessionError> {
        if self.is_finalized() {
            return Err(SessionError::Finalized {
                session_id: self.id.clone(),
            });
        }
        if !self.targets.iter().any(|t| t.id == outcome.target) {
            return Err(SessionError::UnknownTarget {
                target: outcome.target,
            });
        }

        let finding = crate::rules::classify_finding(outcome);
        self.summary.record(finding.severity);
        self.findings.push(finding);
        Ok(&self.findings[self.findings.len() - 1])
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn finalize(&mut self, status: SessionStatus) {
        if self.is_finalized() {
            return;
        }
        self.status = match status {
            SessionStatus::Running => SessionStatus::Complete,
            other => other,
        };
        self.finished_at = Some(now_rfc3339());
    }

    pub fn recompute_summary(&self) -> SeveritySummary {
        SeveritySummary::from_severities(self.findings.iter().map(|f| f.severity))
    }
}

/// Groups findings by (category, message), accumulating affected targets in
/// first-seen order. Output is ordered by severity descending, then by first
/// occurrence.
pub fn build_recommendations(session: &Session) -> Vec<Recommendation> {
    let mut recommendations: Vec<Recommendation> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for finding in &session.findings {
        for message in crate::rules::recommendation_messages(finding) {
            let key = (finding.category.clone(), message);
            if let Some(&i) = index.get(&key) {
                let rec = &mut recommendations[i];
                if !rec.affected_targets.contains(&finding.outcome.target) {
                    rec.affected_targets.push(finding.outcome.target.clone());
                }
                rec.severity = rec.severity.max(finding.severity);
                continue;
            }
            index.insert(key.clone(), recommendations.len());
            recommendations.push(Recommendation {
                category: key.0,
                severity: finding.severity,
                affected_targets: vec![finding.outcome.target.clone()],
                message: key.1,
            });
        }
    }

    recommendations.sort_by(|a, b| b.severity.cmp(&a.severity));
    recommendations
}

/// Shared append-only view of a live session. Appends are serialised by one
/// lock, so concurrent actors never lose or interleave findings.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    inner: Arc<Mutex<Session>>,
}

impl SessionRecorder {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub async fn record(&self, outcome: Outcome) -> Result<(), SessionError> {
        let mut session = self.inner.lock().await;
        session.add_outcome(outcome).map(|_| ())
    }

    pub async fn note(&self, note: impl Into<String>) {
        self.inner.lock().await.add_note(note);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.findings.len()
    }

    pub async fn snapshot(&self) -> Session {
        self.inner.lock().await.clone()
    }

    pub async fn finish(self, status: SessionStatus) -> Session {
        let mut session = self.inner.lock().await;
        session.finalize(status);
        session.clone()
    }
}

fn next_session_id(mode: SessionMode) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{mode}_{stamp}_{}_{seq}", std::process::id())
}
