use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::core::Target;
use crate::session::SessionError;

/// Ordered set of targets keyed by id. Sessions take a snapshot of the
/// selected targets at start, so later reconfiguration never leaks in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRegistry {
    targets: Vec<Target>,
}

impl TargetRegistry {
    pub fn new(targets: Vec<Target>) -> Result<Self, SessionError> {
        let mut seen: Vec<&str> = Vec::with_capacity(targets.len());
        for t in &targets {
            let id = t.id.trim();
            if id.is_empty() {
                return Err(SessionError::configuration("ターゲット id が空です"));
            }
            if seen.contains(&id) {
                return Err(SessionError::configuration(format!(
                    "ターゲット id が重複しています: {id}"
                )));
            }
            seen.push(id);

            let base = t.base_address.trim().to_ascii_lowercase();
            let rest = base
                .strip_prefix("http://")
                .or_else(|| base.strip_prefix("https://"));
            if rest.is_none_or(str::is_empty) {
                return Err(SessionError::configuration(format!(
                    "ターゲット `{id}` の base_address が不正です: {}",
                    t.base_address
                )));
            }
        }
        Ok(Self { targets })
    }

    pub fn defaults() -> Self {
        let mut targets = vec![Target::new(
            "api-gateway",
            "http://localhost:8080",
            "/actuator/health",
        )];
        for (id, port) in DEFAULT_SERVICES {
            targets.push(Target::new(
                id,
                format!("http://localhost:{port}"),
                format!("/{id}/actuator/health"),
            ));
        }
        Self { targets }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Returns the targets whose id matches any of `patterns`, in registry
    /// order. No pattern selects everything.
    pub fn select(&self, patterns: &[String]) -> Result<Vec<Target>> {
        if patterns.is_empty() {
            return Ok(self.targets.clone());
        }
        let set = build_selector(patterns)?;
        let selected: Vec<Target> = self
            .targets
            .iter()
            .filter(|t| set.is_match(&t.id))
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(crate::exit::invalid_args(format!(
                "--service に一致するターゲットがありません: {}",
                patterns.join(", ")
            )));
        }
        Ok(selected)
    }
}

const DEFAULT_SERVICES: [(&str, u16); 5] = [
    ("user-service", 8700),
    ("product-service", 8500),
    ("order-service", 8300),
    ("payment-service", 8400),
    ("favourite-service", 8800),
];

fn build_selector(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let pat = pat.trim();
        if pat.is_empty() {
            continue;
        }
        builder.add(
            Glob::new(pat)
                .with_context(|| format!("--service の glob が不正です: {pat}"))
                .map_err(crate::exit::invalid_args_err)?,
        );
    }
    builder
        .build()
        .context("--service の glob を構築できません")
        .map_err(crate::exit::invalid_args_err)
}
