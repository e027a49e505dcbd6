use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{ProbeError, ProbeReport, ProbeSettings, ProbeUnit, SECURITY_HEADERS};
use crate::core::Target;
use crate::http::{HttpClient, HttpRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMatch {
    Contains(&'static str),
    OneOf(&'static [&'static str]),
}

impl HeaderMatch {
    fn accepts(self, value: &str) -> bool {
        match self {
            HeaderMatch::Contains(needle) => value.contains(needle),
            HeaderMatch::OneOf(options) => options.iter().any(|o| value.contains(o)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderExpectation {
    pub name: &'static str,
    pub expected: HeaderMatch,
}

pub const EXPECTED_HEADERS: [HeaderExpectation; 4] = [
    HeaderExpectation {
        name: "X-Content-Type-Options",
        expected: HeaderMatch::Contains("nosniff"),
    },
    HeaderExpectation {
        name: "X-Frame-Options",
        expected: HeaderMatch::OneOf(&["DENY", "SAMEORIGIN"]),
    },
    HeaderExpectation {
        name: "X-XSS-Protection",
        expected: HeaderMatch::Contains("1; mode=block"),
    },
    HeaderExpectation {
        name: "Strict-Transport-Security",
        expected: HeaderMatch::Contains("max-age"),
    },
];

/// Fetches the liveness path once and grades each expected header. A
/// missing or mismatching header is data, not a probe failure.
pub struct SecurityHeadersProbe {
    request_timeout: Duration,
    timeout: Duration,
}

impl SecurityHeadersProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout,
            timeout: settings.probe_timeout,
        }
    }
}

#[async_trait]
impl ProbeUnit for SecurityHeadersProbe {
    fn name(&self) -> &str {
        SECURITY_HEADERS
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        target: &Target,
        client: &dyn HttpClient,
    ) -> Result<ProbeReport, ProbeError> {
        let resp = client
            .request(HttpRequest::get(target.liveness_url(), self.request_timeout))
            .await?;

        let mut headers = Map::new();
        let mut missing = Vec::new();
        let mut insecure = Vec::new();
        for exp in EXPECTED_HEADERS {
            let entry = match resp.header(exp.name) {
                Some(value) => {
                    let secure = exp.expected.accepts(value);
                    if !secure {
                        insecure.push(exp.name);
                    }
                    json!({"present": true, "value": value, "secure": secure})
                }
                None => {
                    missing.push(exp.name);
                    json!({"present": false, "secure": false})
                }
            };
            headers.insert(exp.name.to_string(), entry);
        }

        Ok(ProbeReport::new(Some(resp.status))
            .with("headers", Value::Object(headers))
            .with("missing", json!(missing))
            .with("insecure", json!(insecure)))
    }
}
