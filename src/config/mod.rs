use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::Target;
use crate::load::{self, ActorProfileSpec, BehaviorSpec, LoadPlan, MixSpec, Workload};
use crate::probes::{ALL_PROBES, ProbeSettings};
use crate::registry::TargetRegistry;
use crate::session::SessionError;

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub ui: UiConfig,
    pub log: LogConfig,
    pub http: HttpConfig,
    pub report: ReportConfig,
    pub security: SecurityConfig,
    pub load: LoadConfig,
    pub targets: Vec<TargetEntry>,
    /// Where the file layer came from; not part of the file format.
    #[serde(skip)]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub color: bool,
    pub max_table_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportConfig {
    pub dir: String,
    pub save: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityConfig {
    pub probes: Vec<String>,
    pub probe_timeout_ms: u64,
    pub disclosure_paths: Vec<String>,
    pub sensitive_keywords: Vec<String>,
    pub protected_paths: Vec<String>,
    pub expected_methods: Vec<String>,
    pub invalid_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadConfig {
    pub profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_rate: Option<u32>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub run_time: Option<Duration>,
    pub services: Vec<String>,
    pub behaviors: Vec<BehaviorSpec>,
    pub mixes: Vec<MixSpec>,
    pub actor_profiles: Vec<ActorProfileSpec>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        let probes = ProbeSettings::default();
        Self {
            ui: UiConfig {
                color: true,
                max_table_rows: 20,
            },
            log: LogConfig {
                level: "info".to_string(),
            },
            http: HttpConfig {
                timeout_ms: 5_000,
                user_agent: crate::http::DEFAULT_USER_AGENT.to_string(),
            },
            report: ReportConfig {
                dir: "reports".to_string(),
                save: true,
            },
            security: SecurityConfig {
                probes: ALL_PROBES.iter().map(|s| s.to_string()).collect(),
                probe_timeout_ms: probes.probe_timeout.as_millis() as u64,
                disclosure_paths: probes.disclosure_paths,
                sensitive_keywords: probes.sensitive_keywords,
                protected_paths: probes.protected_paths,
                expected_methods: probes.expected_methods,
                invalid_token: probes.invalid_token,
            },
            load: LoadConfig {
                profile: load::DEFAULT_PROFILE.to_string(),
                users: None,
                spawn_rate: None,
                run_time: None,
                services: vec!["api-gateway".to_string()],
                behaviors: load::default_behaviors(),
                mixes: load::default_mixes(),
                actor_profiles: load::default_actor_profiles(),
            },
            targets: TargetRegistry::defaults()
                .targets()
                .iter()
                .map(TargetEntry::from)
                .collect(),
            config_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    ui: Option<RawUiConfig>,
    log: Option<RawLogConfig>,
    http: Option<RawHttpConfig>,
    report: Option<RawReportConfig>,
    security: Option<RawSecurityConfig>,
    load: Option<RawLoadConfig>,
    targets: Option<Vec<TargetEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawUiConfig {
    color: Option<bool>,
    max_table_rows: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawLogConfig {
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHttpConfig {
    timeout_ms: Option<u64>,
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReportConfig {
    dir: Option<String>,
    save: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawSecurityConfig {
    probes: Option<Vec<String>>,
    probe_timeout_ms: Option<u64>,
    disclosure_paths: Option<Vec<String>>,
    sensitive_keywords: Option<Vec<String>>,
    protected_paths: Option<Vec<String>>,
    expected_methods: Option<Vec<String>>,
    invalid_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLoadConfig {
    profile: Option<String>,
    users: Option<u32>,
    spawn_rate: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    run_time: Option<Duration>,
    services: Option<Vec<String>>,
    behaviors: Option<Vec<BehaviorSpec>>,
    mixes: Option<Vec<MixSpec>>,
    actor_profiles: Option<Vec<ActorProfileSpec>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetEntry {
    pub id: String,
    pub base_address: String,
    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,
}

impl From<&Target> for TargetEntry {
    fn from(t: &Target) -> Self {
        Self {
            id: t.id.clone(),
            base_address: t.base_address.clone(),
            liveness_path: t.liveness_path.clone(),
        }
    }
}

impl TargetEntry {
    pub fn to_target(&self) -> Target {
        Target::new(&self.id, &self.base_address, &self.liveness_path)
    }
}

fn default_liveness_path() -> String {
    "/actuator/health".to_string()
}

pub fn default_config_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/svcprobe/config.toml")
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Built-in defaults, then the TOML file, then `SVCPROBE_*` variables.
/// Command-line flags are applied by the caller on top.
pub fn load(config_path: Option<&Path>, home_dir: Option<&Path>) -> Result<EffectiveConfig> {
    load_with_env(config_path, home_dir, |key| std::env::var(key).ok())
}

fn load_with_env(
    config_path: Option<&Path>,
    home_dir: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::default();

    let path = config_path
        .map(ToOwned::to_owned)
        .or_else(|| env("SVCPROBE_CONFIG").filter(|p| !p.trim().is_empty()).map(PathBuf::from))
        .or_else(|| home_dir.map(default_config_path));
    let explicit = config_path.is_some();

    if let Some(path) = path {
        if path.exists() {
            let s = std::fs::read_to_string(&path).with_context(|| {
                format!("設定ファイルの読み取りに失敗しました: {}", path.display())
            })?;
            let raw: RawConfig =
                toml::from_str(&s).context("設定ファイル(TOML)の解析に失敗しました")?;
            apply_raw_config(&mut cfg, raw);
            cfg.config_path = Some(path.display().to_string());
        } else if explicit {
            return Err(anyhow::anyhow!(
                "設定ファイルが見つかりません: {}",
                path.display()
            ));
        }
    }

    apply_env_overrides(&mut cfg, env)?;

    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig) {
    if let Some(ui) = raw.ui {
        if let Some(color) = ui.color {
            cfg.ui.color = color;
        }
        if let Some(max_table_rows) = ui.max_table_rows {
            cfg.ui.max_table_rows = max_table_rows;
        }
    }

    if let Some(level) = raw.log.and_then(|l| l.level) {
        cfg.log.level = level;
    }

    if let Some(http) = raw.http {
        if let Some(timeout_ms) = http.timeout_ms {
            cfg.http.timeout_ms = timeout_ms;
        }
        if let Some(user_agent) = http.user_agent {
            cfg.http.user_agent = user_agent;
        }
    }

    if let Some(report) = raw.report {
        if let Some(dir) = report.dir {
            cfg.report.dir = dir;
        }
        if let Some(save) = report.save {
            cfg.report.save = save;
        }
    }

    if let Some(sec) = raw.security {
        let s = &mut cfg.security;
        if let Some(v) = sec.probes {
            s.probes = v;
        }
        if let Some(v) = sec.probe_timeout_ms {
            s.probe_timeout_ms = v;
        }
        if let Some(v) = sec.disclosure_paths {
            s.disclosure_paths = v;
        }
        if let Some(v) = sec.sensitive_keywords {
            s.sensitive_keywords = v;
        }
        if let Some(v) = sec.protected_paths {
            s.protected_paths = v;
        }
        if let Some(v) = sec.expected_methods {
            s.expected_methods = v;
        }
        if let Some(v) = sec.invalid_token {
            s.invalid_token = v;
        }
    }

    if let Some(ld) = raw.load {
        let l = &mut cfg.load;
        if let Some(v) = ld.profile {
            l.profile = v;
        }
        if ld.users.is_some() {
            l.users = ld.users;
        }
        if ld.spawn_rate.is_some() {
            l.spawn_rate = ld.spawn_rate;
        }
        if ld.run_time.is_some() {
            l.run_time = ld.run_time;
        }
        if let Some(v) = ld.services {
            l.services = v;
        }
        if let Some(v) = ld.behaviors {
            l.behaviors = v;
        }
        if let Some(v) = ld.mixes {
            l.mixes = v;
        }
        if let Some(v) = ld.actor_profiles {
            l.actor_profiles = v;
        }
    }

    if let Some(targets) = raw.targets {
        cfg.targets = targets;
    }
}

fn apply_env_overrides(
    cfg: &mut EffectiveConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(v) = env("SVCPROBE_UI_COLOR") {
        cfg.ui.color = parse_bool(&v).with_context(|| "SVCPROBE_UI_COLOR")?;
    }
    if let Some(v) = env("SVCPROBE_UI_MAX_TABLE_ROWS") {
        cfg.ui.max_table_rows = v
            .trim()
            .parse::<usize>()
            .with_context(|| "SVCPROBE_UI_MAX_TABLE_ROWS")?;
    }
    if let Some(v) = env("SVCPROBE_LOG_LEVEL") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.log.level = v.to_string();
        }
    }
    if let Some(v) = env("SVCPROBE_HTTP_TIMEOUT_MS") {
        cfg.http.timeout_ms = v
            .trim()
            .parse::<u64>()
            .with_context(|| "SVCPROBE_HTTP_TIMEOUT_MS")?;
    }
    if let Some(v) = env("SVCPROBE_REPORT_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.report.dir = v.to_string();
        }
    }
    if let Some(v) = env("SVCPROBE_REPORT_SAVE") {
        cfg.report.save = parse_bool(&v).with_context(|| "SVCPROBE_REPORT_SAVE")?;
    }
    if let Some(v) = env("SVCPROBE_LOAD_PROFILE") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.load.profile = v.to_string();
        }
    }
    if let Some(v) = env("SVCPROBE_LOAD_USERS") {
        cfg.load.users = Some(
            v.trim()
                .parse::<u32>()
                .with_context(|| "SVCPROBE_LOAD_USERS")?,
        );
    }
    if let Some(v) = env("SVCPROBE_LOAD_SPAWN_RATE") {
        cfg.load.spawn_rate = Some(
            v.trim()
                .parse::<u32>()
                .with_context(|| "SVCPROBE_LOAD_SPAWN_RATE")?,
        );
    }
    if let Some(v) = env("SVCPROBE_LOAD_RUN_TIME") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.load.run_time = Some(
                humantime::parse_duration(v).with_context(|| "SVCPROBE_LOAD_RUN_TIME")?,
            );
        }
    }

    Ok(())
}

fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "真偽値が不正です: {s}（true|false|1|0|yes|no|on|off を指定してください）"
        )),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOverrides<'a> {
    pub profile: Option<&'a str>,
    pub users: Option<u32>,
    pub spawn_rate: Option<u32>,
    pub run_time: Option<Duration>,
}

impl EffectiveConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.http.timeout_ms)
    }

    pub fn registry(&self) -> Result<TargetRegistry, SessionError> {
        TargetRegistry::new(self.targets.iter().map(TargetEntry::to_target).collect())
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        let s = &self.security;
        ProbeSettings {
            request_timeout: self.request_timeout(),
            probe_timeout: Duration::from_millis(s.probe_timeout_ms),
            disclosure_paths: s.disclosure_paths.clone(),
            sensitive_keywords: s.sensitive_keywords.clone(),
            protected_paths: s.protected_paths.clone(),
            expected_methods: s.expected_methods.clone(),
            invalid_token: s.invalid_token.clone(),
        }
    }

    /// Preset first, then the mix of a lone target (unless `--profile`
    /// picked the preset), then config values, then command-line overrides.
    pub fn load_plan(
        &self,
        overrides: LoadOverrides<'_>,
        targets: &[Target],
    ) -> Result<LoadPlan, SessionError> {
        let name = overrides.profile.unwrap_or(&self.load.profile);
        let preset = load::profile(name).ok_or_else(|| {
            SessionError::configuration(format!(
                "不明な負荷プロファイルです: {name}（指定可能: {}）",
                load::profile_names().join(", ")
            ))
        })?;
        let mix = match targets {
            [only] if overrides.profile.is_none() => load::mix_for(&self.load.mixes, &only.id)?,
            _ => None,
        };
        let users = overrides
            .users
            .or(self.load.users)
            .or(mix.and_then(|m| m.users))
            .unwrap_or(preset.users);
        let spawn_rate = overrides
            .spawn_rate
            .or(self.load.spawn_rate)
            .or(mix.and_then(|m| m.spawn_rate))
            .unwrap_or(preset.spawn_rate);
        let run_time = overrides
            .run_time
            .or(self.load.run_time)
            .unwrap_or(preset.run_time);
        LoadPlan::new(users, spawn_rate, run_time)
    }

    pub fn workload(&self) -> Result<Workload, SessionError> {
        Workload::build(
            &self.load.behaviors,
            &self.load.mixes,
            &self.load.actor_profiles,
            self.request_timeout(),
        )
    }

    /// Checks everything a session would reject at start.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.http.timeout_ms == 0 {
            return Err(SessionError::configuration("http.timeout_ms は 1 以上にしてください"));
        }
        if self.security.probe_timeout_ms == 0 {
            return Err(SessionError::configuration(
                "security.probe_timeout_ms は 1 以上にしてください",
            ));
        }
        self.registry()?;
        crate::probes::build_probes(&self.security.probes, &self.probe_settings())?;
        self.workload()?;
        self.load_plan(LoadOverrides::default(), &[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_file(contents: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "svcprobe-config-test-{}-{n}.toml",
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("write");
        path
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = EffectiveConfig::default();
        cfg.validate().expect("valid");
        assert_eq!(cfg.targets.len(), 6);
        assert_eq!(cfg.security.probes.len(), ALL_PROBES.len());
        let plan = cfg.load_plan(LoadOverrides::default(), &[]).expect("plan");
        assert_eq!((plan.users, plan.spawn_rate), (100, 10));
    }

    #[test]
    fn file_then_env_then_flags() {
        let path = temp_file(
            r#"
[http]
timeout_ms = 1500

[load]
profile = "light"
users = 7

[[targets]]
id = "api"
base_address = "http://localhost:9081"
"#,
        );
        let cfg = load_with_env(
            Some(&path),
            None,
            env_of(&[("SVCPROBE_LOAD_USERS", "9"), ("SVCPROBE_REPORT_SAVE", "off")]),
        )
        .expect("load");
        let _ = std::fs::remove_file(&path);

        assert_eq!(cfg.http.timeout_ms, 1500);
        assert!(!cfg.report.save);
        let registry = cfg.registry().expect("registry");
        assert_eq!(
            registry.targets(),
            &[Target::new("api", "http://localhost:9081", "/actuator/health")]
        );

        let plan = cfg.load_plan(LoadOverrides::default(), &[]).expect("plan");
        assert_eq!((plan.users, plan.spawn_rate), (9, 5));
        let plan = cfg
            .load_plan(
                LoadOverrides {
                    users: Some(3),
                    run_time: Some(Duration::from_secs(5400)),
                    ..LoadOverrides::default()
                },
                &[],
            )
            .expect("plan");
        assert_eq!(plan.users, 3);
        assert_eq!(plan.run_time, Duration::from_secs(5400));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let missing = std::env::temp_dir().join("svcprobe-definitely-missing.toml");
        assert!(load_with_env(Some(&missing), None, env_of(&[])).is_err());
    }

    #[test]
    fn config_env_var_selects_the_file() {
        let path = temp_file("[ui]\nmax_table_rows = 3\n");
        let cfg = load_with_env(
            None,
            None,
            env_of(&[("SVCPROBE_CONFIG", path.to_str().expect("utf8"))]),
        )
        .expect("load");
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.ui.max_table_rows, 3);
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let err = load_with_env(None, None, env_of(&[("SVCPROBE_UI_COLOR", "maybe")])).unwrap_err();
        assert!(format!("{err:#}").contains("SVCPROBE_UI_COLOR"));

        let err =
            load_with_env(None, None, env_of(&[("SVCPROBE_LOAD_RUN_TIME", "soon")])).unwrap_err();
        assert!(format!("{err:#}").contains("SVCPROBE_LOAD_RUN_TIME"));
    }

    #[test]
    fn run_time_reads_human_durations_from_file_and_env() {
        let path = temp_file("[load]\nrun_time = \"1h 30m\"\n");
        let cfg = load_with_env(Some(&path), None, env_of(&[])).expect("load");
        assert_eq!(cfg.load.run_time, Some(Duration::from_secs(5400)));

        let cfg = load_with_env(Some(&path), None, env_of(&[("SVCPROBE_LOAD_RUN_TIME", "90s")]))
            .expect("load");
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.load.run_time, Some(Duration::from_secs(90)));

        let path = temp_file("[load]\nrun_time = \"soon\"\n");
        let result = load_with_env(Some(&path), None, env_of(&[]));
        let _ = std::fs::remove_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn lone_service_takes_its_mix_sizing() {
        let cfg = EffectiveConfig::default();
        let registry = cfg.registry().expect("registry");
        let users = registry.select(&["user-service".to_string()]).expect("select");

        let plan = cfg.load_plan(LoadOverrides::default(), &users).expect("plan");
        assert_eq!((plan.users, plan.spawn_rate), (50, 5));
        assert_eq!(plan.run_time, Duration::from_secs(15 * 60));

        let plan = cfg
            .load_plan(
                LoadOverrides {
                    profile: Some("quick"),
                    ..LoadOverrides::default()
                },
                &users,
            )
            .expect("plan");
        assert_eq!((plan.users, plan.spawn_rate), (10, 2));

        let plan = cfg
            .load_plan(
                LoadOverrides {
                    users: Some(4),
                    ..LoadOverrides::default()
                },
                &users,
            )
            .expect("plan");
        assert_eq!((plan.users, plan.spawn_rate), (4, 5));

        let everything = registry.select(&[]).expect("select");
        let plan = cfg.load_plan(LoadOverrides::default(), &everything).expect("plan");
        assert_eq!((plan.users, plan.spawn_rate), (100, 10));
    }

    #[test]
    fn validation_reports_configuration_errors() {
        let mut cfg = EffectiveConfig::default();
        cfg.load.behaviors[0].weight = 0;
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = EffectiveConfig::default();
        cfg.security.probes = vec!["zap".to_string()];
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = EffectiveConfig::default();
        cfg.load.run_time = Some(Duration::ZERO);
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = EffectiveConfig::default();
        cfg.load.mixes[0].behaviors.clear();
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = EffectiveConfig::default();
        cfg.load.actor_profiles[1].min_wait_ms = Some(9_000);
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));

        let mut cfg = EffectiveConfig::default();
        cfg.load.profile = "ludicrous".to_string();
        assert!(matches!(cfg.validate(), Err(SessionError::Configuration(_))));
    }

    #[test]
    fn shown_config_parses_back() {
        let text = toml::to_string_pretty(&EffectiveConfig::default()).expect("toml");
        let path = temp_file(&text);
        let cfg = load_with_env(Some(&path), None, env_of(&[])).expect("load");
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.targets, EffectiveConfig::default().targets);
        assert_eq!(cfg.load.behaviors, load::default_behaviors());
        assert_eq!(cfg.load.mixes, load::default_mixes());
        assert_eq!(cfg.load.actor_profiles, load::default_actor_profiles());
    }

    #[test]
    fn shown_config_with_a_source_path_parses_back() {
        let mut shown = EffectiveConfig::default();
        shown.config_path = Some("/home/me/.config/svcprobe/config.toml".to_string());
        shown.load.run_time = Some(Duration::from_secs(90));
        let text = toml::to_string_pretty(&shown).expect("toml");
        assert!(!text.contains("config_path"));

        let path = temp_file(&text);
        let cfg = load_with_env(Some(&path), None, env_of(&[])).expect("load");
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.load.run_time, Some(Duration::from_secs(90)));
        assert_eq!(cfg.config_path, Some(path.display().to_string()));
    }

    #[test]
    fn unknown_top_level_keys_are_rejected() {
        let path = temp_file("[scan]\ndeep = true\n");
        let result = load_with_env(Some(&path), None, env_of(&[]));
        let _ = std::fs::remove_file(&path);
        assert!(result.is_err());
    }
}
