use serde::{Deserialize, Serialize};

use crate::core::{Outcome, Severity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedFinding {
    pub severity: Severity,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub category: String,
    pub severity: Severity,
    pub affected_targets: Vec<String>,
    pub message: String,
}
