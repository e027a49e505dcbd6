use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{INFORMATION_DISCLOSURE, ProbeError, ProbeReport, ProbeSettings, ProbeUnit, all_failed};
use crate::core::Target;
use crate::http::{HttpClient, HttpRequest};

/// Fetches diagnostic endpoints and looks for sensitive keywords in any body
/// served with 200. Matching is plain lower-case substring containment.
pub struct DisclosureProbe {
    request_timeout: Duration,
    timeout: Duration,
    paths: Vec<String>,
    keywords: Vec<String>,
}

impl DisclosureProbe {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout,
            timeout: settings.probe_timeout,
            paths: settings.disclosure_paths.clone(),
            keywords: settings
                .sensitive_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }

    fn sensitive_matches(&self, body: &str) -> Vec<&str> {
        let body = body.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| body.contains(k.as_str()))
            .map(String::as_str)
            .collect()
    }
}

#[async_trait]
impl ProbeUnit for DisclosureProbe {
    fn name(&self) -> &str {
        INFORMATION_DISCLOSURE
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
            let req = HttpRequest::get(target.url(path), self.request_timeout);
            match client.request(req).await {
                Ok(resp) if resp.status == 200 => {
                    let found = self.sensitive_matches(&resp.body);
                    let risk = if found.is_empty() { "LOW" } else { "HIGH" };
                    endpoints.push(json!({
                        "path": path,
                        "accessible": true,
                        "status_code": resp.status,
                        "sensitive_data_found": found,
                        "risk_level": risk,
                    }));
                }
                Ok(resp) => endpoints.push(json!({
                    "path": path,
                    "accessible": false,
                    "status_code": resp.status,
                })),
                Err(err) => {
                    endpoints.push(json!({
                        "path": path,
                        "accessible": false,
                        "error": err.to_string(),
                    }));
                    errors.push(err);
                }
            }
        }
        all_failed(errors, self.paths.len())?;

        Ok(ProbeReport::new(None).with("endpoints", json!(endpoints)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::probes::fake::FakeClient;

    fn target() -> Target {
        Target::new("order-service", "http://svc.test", "/actuator/health")
    }

    fn settings(paths: &[&str]) -> ProbeSettings {
        ProbeSettings {
            disclosure_paths: paths.iter().map(|p| p.to_string()).collect(),
            ..ProbeSettings::default()
        }
    }

    #[tokio::test]
    async fn flags_keywords_case_insensitively() {
        let client = FakeClient::new().route("GET", "http://svc.test/actuator/env", |_| {
            Ok(HttpResponse::new(200).with_body(r#"{"spring.datasource.PASSWORD":"x","url":"jdbc:mysql"}"#))
        });
        let report = DisclosureProbe::new(&settings(&["/actuator/env"]))
            .run(&target(), &client)
            .await
            .expect("run");
        let entry = &report.detail["endpoints"][0];
        assert_eq!(entry["accessible"], json!(true));
        assert_eq!(entry["sensitive_data_found"], json!(["password", "jdbc"]));
        assert_eq!(entry["risk_level"], json!("HIGH"));
    }

    #[tokio::test]
    async fn non_200_is_not_accessible() {
        let client = FakeClient::new();
        let report = DisclosureProbe::new(&settings(&["/actuator/env", "/error"]))
            .run(&target(), &client)
            .await
            .expect("run");
        let endpoints = report.detail["endpoints"].as_array().expect("array");
        assert_eq!(endpoints.len(), 2);
        for e in endpoints {
            assert_eq!(e["accessible"], json!(false));
            assert_eq!(e["status_code"], json!(404));
            assert!(e.get("sensitive_data_found").is_none());
        }
    }

    #[tokio::test]
    async fn clean_body_is_low() {
        let client = FakeClient::new().route("GET", "http://svc.test/actuator/info", |_| {
            Ok(HttpResponse::new(200).with_body(r#"{"app":"shop"}"#))
        });
        let report = DisclosureProbe::new(&settings(&["/actuator/info"]))
            .run(&target(), &client)
            .await
            .expect("run");
        assert_eq!(report.detail["endpoints"][0]["risk_level"], json!("LOW"));
        assert_eq!(report.detail["endpoints"][0]["sensitive_data_found"], json!([]));
    }
}
