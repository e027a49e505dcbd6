mod auth;
mod disclosure;
mod dispatch;
mod headers;
mod methods;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::{Detail, Target};
use crate::http::{HttpClient, TransportError};
use crate::session::SessionError;

pub use auth::AuthenticationProbe;
pub use disclosure::DisclosureProbe;
pub use dispatch::{run_all, run_all_until};
pub use headers::{HeaderExpectation, HeaderMatch, SecurityHeadersProbe};
pub use methods::HttpMethodsProbe;
pub use transport::TransportSecurityProbe;

pub const SECURITY_HEADERS: &str = "security_headers";
pub const HTTP_METHODS: &str = "http_methods";
pub const INFORMATION_DISCLOSURE: &str = "information_disclosure";
pub const AUTHENTICATION: &str = "authentication";
pub const TRANSPORT_SECURITY: &str = "transport_security";

/// Built-in probes in execution order.
pub const ALL_PROBES: [&str; 5] = [
    SECURITY_HEADERS,
    HTTP_METHODS,
    INFORMATION_DISCLOSURE,
    AUTHENTICATION,
    TRANSPORT_SECURITY,
];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected response: {message}")]
    Logic { message: String, raw: Detail },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub status_code: Option<u16>,
    pub detail: Detail,
}

impl ProbeReport {
    pub fn new(status_code: Option<u16>) -> Self {
        Self {
            status_code,
            detail: Detail::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }
}

/// One independent check against a target. `run` issues its own requests;
/// the dispatcher owns the overall timeout and failure capture.
#[async_trait]
pub trait ProbeUnit: Send + Sync {
    fn name(&self) -> &str;

    fn timeout(&self) -> Duration;

    async fn run(&self, target: &Target, client: &dyn HttpClient)
    -> Result<ProbeReport, ProbeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub disclosure_paths: Vec<String>,
    pub sensitive_keywords: Vec<String>,
    pub protected_paths: Vec<String>,
    pub expected_methods: Vec<String>,
    pub invalid_token: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(30),
            disclosure_paths: strings(&[
                "/actuator/health",
                "/actuator/info",
                "/actuator/env",
                "/actuator/configprops",
                "/actuator/dump",
                "/actuator/trace",
                "/error",
            ]),
            sensitive_keywords: strings(&[
                "password", "secret", "key", "token", "jdbc", "database",
            ]),
            protected_paths: strings(&["/api/users", "/api/products", "/api/orders"]),
            expected_methods: Vec::new(),
            invalid_token: "invalid-token".to_string(),
        }
    }
}

pub fn build_probes(
    names: &[String],
    settings: &ProbeSettings,
) -> Result<Vec<Arc<dyn ProbeUnit>>, SessionError> {
    let mut probes: Vec<Arc<dyn ProbeUnit>> = Vec::with_capacity(names.len());
    for name in names {
        let probe: Arc<dyn ProbeUnit> = match name.trim() {
            SECURITY_HEADERS => Arc::new(SecurityHeadersProbe::new(settings)),
            HTTP_METHODS => Arc::new(HttpMethodsProbe::new(settings)),
            INFORMATION_DISCLOSURE => Arc::new(DisclosureProbe::new(settings)),
            AUTHENTICATION => Arc::new(AuthenticationProbe::new(settings)),
            TRANSPORT_SECURITY => Arc::new(TransportSecurityProbe::new(settings)),
            other => {
                return Err(SessionError::configuration(format!(
                    "不明な probe です: {other}（指定可能: {}）",
                    ALL_PROBES.join(", ")
                )));
            }
        };
        if probes.iter().any(|p| p.name() == probe.name()) {
            continue;
        }
        probes.push(probe);
    }
    if probes.is_empty() {
        return Err(SessionError::configuration("probe が 1 件も選択されていません"));
    }
    Ok(probes)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Collapses a run where every request failed at transport level into one
/// transport error, so an unreachable target is not reported as clean.
fn all_failed(mut errors: Vec<TransportError>, attempted: usize) -> Result<(), ProbeError> {
    if attempted > 0 && errors.len() == attempted {
        return Err(ProbeError::Transport(errors.swap_remove(0)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_probes_in_requested_order_without_duplicates() {
        let names = vec![
            AUTHENTICATION.to_string(),
            SECURITY_HEADERS.to_string(),
            AUTHENTICATION.to_string(),
        ];
        let probes = build_probes(&names, &ProbeSettings::default()).expect("build");
        let built: Vec<&str> = probes.iter().map(|p| p.name()).collect();
        assert_eq!(built, vec![AUTHENTICATION, SECURITY_HEADERS]);
    }

    #[test]
    fn unknown_probe_is_a_configuration_error() {
        let Err(err) = build_probes(&["zap".to_string()], &ProbeSettings::default()) else {
            panic!("unknown name should be rejected");
        };
        assert!(matches!(err, SessionError::Configuration(_)));
        assert!(err.to_string().contains("zap"));
    }

    #[test]
    fn empty_probe_set_is_a_configuration_error() {
        let Err(err) = build_probes(&[], &ProbeSettings::default()) else {
            panic!("empty selection should be rejected");
        };
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn every_builtin_name_builds() {
        let names: Vec<String> = ALL_PROBES.iter().map(|s| s.to_string()).collect();
        let probes = build_probes(&names, &ProbeSettings::default()).expect("build");
        assert_eq!(probes.len(), ALL_PROBES.len());
        for p in &probes {
            assert_eq!(p.timeout(), Duration::from_secs(30));
        }
    }
}
