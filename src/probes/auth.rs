use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{AUTHENTICATION, ProbeError, ProbeReport, ProbeSettings, ProbeUnit, all_failed};
use crate::core::Target;
use crate::http::{HttpClient, HttpRequest, TransportError};

pub struct AuthenticationProbe {
    request_timeout: Duration,
    timeout: Duration,
    paths: Vec<String>,
    invalid_token: String,
}

impl AuthenticationProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout,
            timeout: settings.probe_timeout,
            paths: settings.protected_paths.clone(),
            invalid_token: settings.invalid_token.clone(),
        }
    }

    async fn variant(
        &self,
        client: &dyn HttpClient,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<Value, TransportError> {
        let mut req = HttpRequest::get(url, self.request_timeout);
        if let Some(token) = bearer {
            req = req.with_header("Authorization", format!("Bearer {token}"));
        }
        let resp = client.request(req).await?;
        Ok(json!({
            "status_code": resp.status,
            "protected": matches!(resp.status, 401 | 403),
        }))
    }
}

#[async_trait]
impl ProbeUnit for AuthenticationProbe {
    fn name(&self) -> &str {
        AUTHENTICATION
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        target: &Target,
        client: &dyn HttpClient,
    ) -> Result<ProbeReport, ProbeError> {
        let mut endpoints = Vec::with_capacity(self.paths.len());
        let mut errors = Vec::new();
        for path in &self.paths {
            let url = target.url(path);
            let no_auth = self.variant(client, &url, None).await;
            let invalid = self
                .variant(client, &url, Some(self.invalid_token.as_str()))
                .await;
            match (no_auth, invalid) {
                (Err(err), Err(_)) => {
                    endpoints.push(json!({"path": path, "error": err.to_string()}));
                    errors.push(err);
                }
                (no_auth, invalid_token) => endpoints.push(json!({
                    "path": path,
                    "no_auth": recorded(no_auth),
                    "invalid_token": recorded(invalid_token),
                })),
            }
        }
        all_failed(errors, self.paths.len())?;

        Ok(ProbeReport::new(None).with("endpoints", json!(endpoints)))
    }
}

/// A variant that failed in transport keeps its error next to the other
/// variant's verdict.
fn recorded(variant: Result<Value, TransportError>) -> Value {
    variant.unwrap_or_else(|err| json!({"error": err.to_string()}))
}
