use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub type Detail = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Probe,
    Behavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Timeout,
    ProbeLogic,
    UnexpectedStatus,
    Panic,
}

impl FailureKind {
    pub const fn is_transport(self) -> bool {
        matches!(self, FailureKind::Transport | FailureKind::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub name: String,
    pub kind: OutcomeKind,
    pub target: String,
    pub timestamp: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: Detail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<u32>,
}

impl Outcome {
    pub fn succeeded(
        kind: OutcomeKind,
        name: impl Into<String>,
        target: impl Into<String>,
        status_code: Option<u16>,
        detail: Detail,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            timestamp: now_rfc3339(),
            success: true,
            status_code,
            detail,
            error: None,
            failure: None,
            actor: None,
        }
    }

    pub fn failed(
        kind: OutcomeKind,
        name: impl Into<String>,
        target: impl Into<String>,
        failure: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            timestamp: now_rfc3339(),
            success: false,
            status_code: None,
            detail: Detail::new(),
            error: Some(error.into()),
            failure: Some(failure),
            actor: None,
        }
    }

    pub fn with_detail(mut self, detail: Detail) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_status_code(mut self, status_code: Option<u16>) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_actor(mut self, actor: u32) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn is_transport_failure(&self) -> bool {
        !self.success && self.failure.is_some_and(FailureKind::is_transport)
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
