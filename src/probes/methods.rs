use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;

use super::{HTTP_METHODS, ProbeError, ProbeReport, ProbeSettings, ProbeUnit, all_failed};
use crate::core::Target;
use crate::http::{HttpClient, HttpRequest};

pub const PROBED_METHODS: [Method; 8] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
    Method::TRACE,
];

pub struct HttpMethodsProbe {
    request_timeout: Duration,
    timeout: Duration,
    expected: Vec<String>,
}

impl HttpMethodsProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout,
            timeout: settings.probe_timeout,
            expected: settings
                .expected_methods
                .iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .collect(),
        }
    }
}

fn is_allowed(status: u16) -> bool {
    !matches!(status, 405 | 501)
}

#[async_trait]
impl ProbeUnit for HttpMethodsProbe {
    fn name(&self) -> &str {
        HTTP_METHODS
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        target: &Target,
        client: &dyn HttpClient,
    ) -> Result<ProbeReport, ProbeError> {
        let url = target.liveness_url();
        let mut methods = Vec::with_capacity(PROBED_METHODS.len());
        let mut errors = Vec::new();
        for method in PROBED_METHODS {
            let name = method.as_str().to_string();
            let req = HttpRequest::new(method, url.clone(), self.request_timeout);
            match client.request(req).await {
                Ok(resp) => methods.push(json!({
                    "method": name,
                    "allowed": is_allowed(resp.status),
                    "status_code": resp.status,
                })),
                Err(err) => {
                    methods.push(json!({
                        "method": name,
                        "allowed": false,
                        "error": err.to_string(),
                    }));
                    errors.push(err);
                }
            }
        }
        all_failed(errors, PROBED_METHODS.len())?;

        Ok(ProbeReport::new(None)
            .with("expected", json!(self.expected))
            .with("methods", json!(methods)))
    }
}
