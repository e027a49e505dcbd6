use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{ProbeError, ProbeReport, ProbeSettings, ProbeUnit, TRANSPORT_SECURITY};
use crate::core::{Detail, Target};
use crate::http::{HttpClient, HttpRequest};

/// Plain HTTP targets are reported without a request. HTTPS targets get one
/// liveness fetch so that TLS problems surface as transport errors.
pub struct TransportSecurityProbe {
    request_timeout: Duration,
    timeout: Duration,
}

impl TransportSecurityProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout,
            timeout: settings.probe_timeout,
        }
    }
}

#[async_trait]
impl ProbeUnit for TransportSecurityProbe {
    fn name(&self) -> &str {
        TRANSPORT_SECURITY
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        target: &Target,
        client: &dyn HttpClient,
    ) -> Result<ProbeReport, ProbeError> {
        if !target.is_https() {
            return Ok(ProbeReport::new(None).with("https", json!(false)));
        }

        let resp = client
            .request(HttpRequest::get(target.liveness_url(), self.request_timeout))
            .await?;
        if !resp.is_success() {
            let mut raw = Detail::new();
            raw.insert("status_code".to_string(), json!(resp.status));
            raw.insert("body".to_string(), json!(excerpt(&resp.body)));
            return Err(ProbeError::Logic {
                message: format!("liveness endpoint answered {} over HTTPS", resp.status),
                raw,
            });
        }
        Ok(ProbeReport::new(Some(resp.status))
            .with("https", json!(true))
            .with("hsts", json!(resp.header("Strict-Transport-Security").is_some())))
    }
}

fn excerpt(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
