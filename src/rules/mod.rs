use serde_json::Value;

use crate::core::{ClassifiedFinding, FailureKind, Outcome, OutcomeKind, Severity};
use crate::probes::{AUTHENTICATION, HTTP_METHODS, INFORMATION_DISCLOSURE, SECURITY_HEADERS, TRANSPORT_SECURITY};

pub const DEFAULT_CATEGORY: &str = "OBSERVATION";

const MUTATING_METHODS: [&str; 4] = ["POST", "PUT", "DELETE", "PATCH"];

pub struct Rule {
    pub id: &'static str,
    pub category: &'static str,
    pub severity: Severity,
    matches: fn(&Outcome) -> bool,
}

impl Rule {
    pub fn matches(&self, outcome: &Outcome) -> bool {
        (self.matches)(outcome)
    }
}

/// Severity policy. Evaluated top to bottom, first match wins.
pub const RULES: &[Rule] = &[
    Rule {
        id: "disclosure-sensitive-data",
        category: "INFORMATION_DISCLOSURE",
        severity: Severity::High,
        matches: disclosure_sensitive_data,
    },
    Rule {
        id: "authentication-unprotected",
        category: "AUTHENTICATION",
        severity: Severity::High,
        matches: authentication_unprotected,
    },
    Rule {
        id: "headers-missing",
        category: "SECURITY_HEADERS",
        severity: Severity::Medium,
        matches: headers_missing,
    },
    Rule {
        id: "methods-mutating-allowed",
        category: "HTTP_METHODS",
        severity: Severity::Medium,
        matches: methods_mutating_allowed,
    },
    Rule {
        id: "transport-plaintext",
        category: "TRANSPORT_SECURITY",
        severity: Severity::Low,
        matches: transport_plaintext,
    },
    Rule {
        id: "load-unexpected-status",
        category: "LOAD_FAILURES",
        severity: Severity::Low,
        matches: load_unexpected_status,
    },
    Rule {
        id: "transport-error",
        category: "TRANSPORT_ERRORS",
        severity: Severity::Low,
        matches: transport_error,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub severity: Severity,
    pub category: &'static str,
    pub rule: Option<&'static str>,
}

pub fn evaluate(outcome: &Outcome) -> Classification {
    for rule in RULES {
        if rule.matches(outcome) {
            return Classification {
                severity: rule.severity,
                category: rule.category,
                rule: Some(rule.id),
            };
        }
    }
    Classification {
        severity: Severity::Info,
        category: DEFAULT_CATEGORY,
        rule: None,
    }
}

pub fn classify(outcome: &Outcome) -> Severity {
    evaluate(outcome).severity
}

pub fn classify_finding(outcome: Outcome) -> ClassifiedFinding {
    let c = evaluate(&outcome);
    ClassifiedFinding {
        severity: c.severity,
        category: c.category.to_string(),
        rule: c.rule.map(str::to_string),
        outcome,
    }
}

/// Message templates used to group findings into recommendations. INFO
/// findings never produce a recommendation.
pub fn recommendation_messages(finding: &ClassifiedFinding) -> Vec<String> {
    if finding.severity == Severity::Info {
        return Vec::new();
    }
    let outcome = &finding.outcome;
    match finding.rule.as_deref() {
        Some("disclosure-sensitive-data") => entries(outcome, "endpoints")
            .filter(|e| !str_list(e, "sensitive_data_found").is_empty())
            .filter_map(|e| e.get("path").and_then(Value::as_str))
            .map(|path| {
                format!("Restrict access to {path} or remove sensitive data from its response")
            })
            .collect(),
        Some("authentication-unprotected") => entries(outcome, "endpoints")
            .filter(|e| variant_unprotected(e, "no_auth") || variant_unprotected(e, "invalid_token"))
            .filter_map(|e| e.get("path").and_then(Value::as_str))
            .map(|path| format!("Require valid credentials on {path}"))
            .collect(),
        Some("headers-missing") => str_list_of(outcome, "missing")
            .into_iter()
            .map(|header| format!("Add {header} header to improve security"))
            .collect(),
        Some("methods-mutating-allowed") => unexpected_mutating_methods(outcome)
            .into_iter()
            .map(|method| {
                format!("Disable {method} on the liveness endpoint unless it is required")
            })
            .collect(),
        Some("transport-plaintext") => vec!["Serve the service over HTTPS".to_string()],
        Some("load-unexpected-status") => vec![format!(
            "Investigate non-2xx responses returned to behavior {}",
            outcome.name
        )],
        Some("transport-error") => vec![format!(
            "Check connectivity: {} could not complete because of a transport error",
            outcome.name
        )],
        _ => vec![format!("Review {} findings", finding.category)],
    }
}

fn is_probe(outcome: &Outcome, name: &str) -> bool {
    outcome.kind == OutcomeKind::Probe && outcome.name == name
}

fn entries<'a>(outcome: &'a Outcome, key: &str) -> impl Iterator<Item = &'a Value> {
    outcome
        .detail
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn str_list<'a>(value: &'a Value, key: &str) -> Vec<&'a str> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn str_list_of<'a>(outcome: &'a Outcome, key: &str) -> Vec<&'a str> {
    outcome
        .detail
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn variant_unprotected(entry: &Value, variant: &str) -> bool {
    entry
        .get(variant)
        .and_then(|v| v.get("protected"))
        .and_then(Value::as_bool)
        == Some(false)
}

fn unexpected_mutating_methods(outcome: &Outcome) -> Vec<&str> {
    let expected = str_list_of(outcome, "expected");
    entries(outcome, "methods")
        .filter(|m| m.get("allowed").and_then(Value::as_bool) == Some(true))
        .filter_map(|m| m.get("method").and_then(Value::as_str))
        .filter(|method| MUTATING_METHODS.contains(method))
        .filter(|method| !expected.iter().any(|e| e.eq_ignore_ascii_case(method)))
        .collect()
}

fn disclosure_sensitive_data(outcome: &Outcome) -> bool {
    is_probe(outcome, INFORMATION_DISCLOSURE)
        && entries(outcome, "endpoints").any(|e| !str_list(e, "sensitive_data_found").is_empty())
}

fn authentication_unprotected(outcome: &Outcome) -> bool {
    is_probe(outcome, AUTHENTICATION)
        && entries(outcome, "endpoints").any(|e| {
            variant_unprotected(e, "no_auth") || variant_unprotected(e, "invalid_token")
        })
}

fn headers_missing(outcome: &Outcome) -> bool {
    is_probe(outcome, SECURITY_HEADERS) && !str_list_of(outcome, "missing").is_empty()
}

fn methods_mutating_allowed(outcome: &Outcome) -> bool {
    is_probe(outcome, HTTP_METHODS) && !unexpected_mutating_methods(outcome).is_empty()
}

fn transport_plaintext(outcome: &Outcome) -> bool {
    is_probe(outcome, TRANSPORT_SECURITY)
        && outcome.detail.get("https").and_then(Value::as_bool) == Some(false)
}

fn load_unexpected_status(outcome: &Outcome) -> bool {
    outcome.kind == OutcomeKind::Behavior
        && !outcome.success
        && outcome.failure == Some(FailureKind::UnexpectedStatus)
}

fn transport_error(outcome: &Outcome) -> bool {
    outcome.is_transport_failure()
}
