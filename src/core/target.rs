use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub base_address: String,
    pub liveness_path: String,
}

impl Target {
    pub fn new(
        id: impl Into<String>,
        base_address: impl Into<String>,
        liveness_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            base_address: base_address.into(),
            liveness_path: liveness_path.into(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        let base = self.base_address.trim_end_matches('/');
        if path.is_empty() {
            return base.to_string();
        }
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub fn liveness_url(&self) -> String {
        self.url(&self.liveness_path)
    }

    pub fn is_https(&self) -> bool {
        self.base_address
            .trim()
            .to_ascii_lowercase()
            .starts_with("https://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_doubling_slashes() {
        let t = Target::new("api", "http://localhost:8080/", "/actuator/health");
        assert_eq!(t.liveness_url(), "http://localhost:8080/actuator/health");
        assert_eq!(t.url("api/users"), "http://localhost:8080/api/users");
        assert_eq!(t.url(""), "http://localhost:8080");
    }

    #[test]
    fn https_detection_ignores_case() {
        assert!(Target::new("a", "HTTPS://example.test", "/").is_https());
        assert!(!Target::new("a", "http://example.test", "/").is_https());
    }
}
