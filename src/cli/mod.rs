use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::config::{EffectiveConfig, LoadOverrides};
use crate::core::Severity;
use crate::engine::{Engine, EngineOptions, Liveness};
use crate::http::{HttpClient, ReqwestClient};
use crate::report::{SavedReport, StructuredReport};
use crate::session::{Session, cancel_pair};
use crate::ui::UiConfig;

#[derive(Debug, Parser)]
#[command(
    name = "svcprobe",
    version,
    about = "マイクロサービス群に対してセキュリティ検査と負荷試験を実行し、結果を集計してレポートを出力する"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Per-request timeout in milliseconds (overrides http.timeout_ms).
    #[arg(long = "timeout-ms", global = true)]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the security probes against the selected services.
    Security(SecurityArgs),
    /// Drive a simulated user population against the selected services.
    Load(LoadArgs),
    /// List the configured targets, optionally checking liveness.
    Targets(TargetsArgs),
    Completion(CompletionArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    /// Service id or glob; repeatable.
    #[arg(long = "service")]
    pub services: Vec<String>,
    #[arg(long)]
    pub skip_liveness: bool,
    #[arg(long)]
    pub markdown: bool,
    #[arg(long)]
    pub no_save: bool,
    #[arg(long = "min-severity", default_value = "LOW")]
    pub min_severity: Severity,
}

#[derive(Debug, Args)]
pub struct SecurityArgs {
    #[command(flatten)]
    pub session: SessionArgs,
    /// Probe name; repeatable. Defaults to security.probes.
    #[arg(long = "probe")]
    pub probes: Vec<String>,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    #[command(flatten)]
    pub session: SessionArgs,
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long)]
    pub users: Option<u32>,
    #[arg(long)]
    pub spawn_rate: Option<u32>,
    /// e.g. 90s, 5m, 1h30m
    #[arg(long, value_parser = humantime::parse_duration)]
    pub run_time: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct TargetsArgs {
    #[arg(long = "service")]
    pub services: Vec<String>,
    #[arg(long)]
    pub check: bool,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();

    let home_dir = crate::config::home_dir();
    let mut cfg = crate::config::load(cli.config.as_deref(), home_dir.as_deref())
        .map_err(crate::exit::invalid_args_err)?;
    if let Some(ms) = cli.timeout_ms {
        cfg.http.timeout_ms = ms;
    }

    init_logging(&cfg, &cli, stderr_is_tty && !cli.no_color && cfg.ui.color);
    cfg.validate()?;

    let color = stdout_is_tty && cfg.ui.color && !cli.no_color;
    let mut ui_cfg = UiConfig {
        color,
        max_table_rows: cfg.ui.max_table_rows,
        min_severity: Severity::Low,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    match &cli.command {
        Commands::Security(args) => {
            ui_cfg.min_severity = args.session.min_severity;
            let registry = cfg.registry()?;
            let targets = registry.select(&args.session.services)?;
            let names = if args.probes.is_empty() {
                cfg.security.probes.clone()
            } else {
                args.probes.clone()
            };
            let probes = crate::probes::build_probes(&names, &cfg.probe_settings())?;
            let engine = build_engine(&cfg, &cli, &args.session)?;
            let session = block_on_cancellable(|cancel| async move {
                engine.security(targets, &probes, cancel).await
            })??;
            finish_session(&session, &cfg, &cli, &args.session, &ui_cfg)?;
        }
        Commands::Load(args) => {
            ui_cfg.min_severity = args.session.min_severity;
            let registry = cfg.registry()?;
            let services = if args.session.services.is_empty() {
                cfg.load.services.clone()
            } else {
                args.session.services.clone()
            };
            let targets = registry.select(&services)?;
            let plan = cfg.load_plan(
                LoadOverrides {
                    profile: args.profile.as_deref(),
                    users: args.users,
                    spawn_rate: args.spawn_rate,
                    run_time: args.run_time,
                },
                &targets,
            )?;
            let workload = Arc::new(cfg.workload()?);
            let engine = build_engine(&cfg, &cli, &args.session)?;
            let session = block_on_cancellable(|cancel| async move {
                engine.load(targets, workload, &plan, cancel).await
            })??;
            finish_session(&session, &cfg, &cli, &args.session, &ui_cfg)?;
        }
        Commands::Targets(args) => {
            let registry = cfg.registry()?;
            let targets = registry.select(&args.services)?;
            let rows: Vec<Liveness> = if args.check {
                let engine = Engine::new(
                    EngineOptions {
                        request_timeout: cfg.request_timeout(),
                        skip_liveness: false,
                        show_progress: false,
                    },
                    http_client(&cfg)?,
                );
                block_on_cancellable(|_cancel| async move { engine.liveness(&targets).await })?
            } else {
                targets
                    .into_iter()
                    .map(|target| Liveness {
                        target,
                        status: None,
                        error: None,
                    })
                    .collect()
            };
            if cli.json {
                let out: Vec<TargetRow<'_>> = rows
                    .iter()
                    .map(|l| TargetRow::new(l, args.check))
                    .collect();
                write_json(&out)?;
            } else {
                crate::ui::print_targets(&rows, args.check, &ui_cfg);
            }
        }
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "svcprobe", &mut out);
        }
        Commands::Config(args) => {
            if args.show {
                if cli.json {
                    write_json(&ShownConfig {
                        config: &cfg,
                        config_path: cfg.config_path.as_deref(),
                    })?;
                } else {
                    if let Some(path) = &cfg.config_path {
                        println!("# config: {path}");
                    }
                    println!("{}", toml::to_string_pretty(&cfg)?);
                }
            } else if !ui_cfg.quiet {
                eprintln!("config: `svcprobe config --show` を使用してください");
            }
        }
    }

    Ok(())
}

/// `RUST_LOG` wins, then `--verbose`/`--quiet`, then `log.level`.
fn init_logging(cfg: &EffectiveConfig, cli: &Cli, color: bool) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        cfg.log.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("svcprobe={level}")))
        .unwrap_or_else(|_| EnvFilter::new("svcprobe=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(color)
        .with_target(false)
        .try_init();
}

fn http_client(cfg: &EffectiveConfig) -> Result<Arc<dyn HttpClient>> {
    Ok(Arc::new(ReqwestClient::new(&cfg.http.user_agent)?))
}

fn build_engine(cfg: &EffectiveConfig, cli: &Cli, args: &SessionArgs) -> Result<Engine> {
    Ok(Engine::new(
        EngineOptions {
            request_timeout: cfg.request_timeout(),
            skip_liveness: args.skip_liveness,
            show_progress: !cli.quiet && !cli.json,
        },
        http_client(cfg)?,
    ))
}

/// Runs `f` on a fresh multi-thread runtime; Ctrl-C cancels the token it
/// receives.
fn block_on_cancellable<F, Fut, T>(f: F) -> Result<T>
where
    F: FnOnce(crate::session::CancelToken) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("非同期ランタイムの初期化に失敗しました")?;
    let (handle, token) = cancel_pair();
    Ok(rt.block_on(async move {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping session");
                handle.cancel();
            }
        });
        f(token).await
    }))
}

fn finish_session(
    session: &Session,
    cfg: &EffectiveConfig,
    cli: &Cli,
    args: &SessionArgs,
    ui_cfg: &UiConfig,
) -> Result<()> {
    let report = crate::report::to_structured_form(session);

    let saved = if args.no_save || !cfg.report.save {
        None
    } else {
        Some(save(&report, Path::new(&cfg.report.dir))?)
    };

    if cli.json {
        write_json(&report)?;
    } else if args.markdown {
        write_markdown(&report)?;
    } else {
        crate::ui::print_session(&report, ui_cfg, saved.as_ref());
    }

    if !report.is_complete() {
        return Err(crate::exit::interrupted(format!(
            "セッション {} は中断されました（部分結果を出力しました）",
            report.session_id
        )));
    }
    Ok(())
}

fn save(report: &StructuredReport, dir: &Path) -> Result<SavedReport> {
    crate::report::save_report(report, dir).map_err(crate::exit::report_failed_err)
}

/// `config --show --json`: the effective values plus where the file layer
/// came from.
#[derive(Debug, Serialize)]
struct ShownConfig<'a> {
    #[serde(flatten)]
    config: &'a EffectiveConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    config_path: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TargetRow<'a> {
    id: &'a str,
    base_address: &'a str,
    liveness_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    up: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl<'a> TargetRow<'a> {
    fn new(live: &'a Liveness, checked: bool) -> Self {
        Self {
            id: &live.target.id,
            base_address: &live.target.base_address,
            liveness_url: live.target.liveness_url(),
            up: checked.then(|| live.is_up()),
            status_code: live.status,
            error: live.error.as_deref(),
        }
    }
}

fn write_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let buf = serde_json::to_vec_pretty(value)?;
    write_stdout(&buf)
}

fn write_markdown(report: &StructuredReport) -> Result<()> {
    let md = crate::report::render_markdown(report);
    write_stdout(md.as_bytes())
}

fn write_stdout(buf: &[u8]) -> Result<()> {
    let mut stdout = io::stdout().lock();
    match stdout.write_all(buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    if buf.ends_with(b"\n") {
        return Ok(());
    }
    match stdout.write_all(b"\n") {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        other => Err(crate::exit::invalid_args(format!(
            "未対応のシェルです: {other}（bash|zsh|fish を指定してください）"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn load_flags_parse() {
        let cli = Cli::try_parse_from([
            "svcprobe",
            "load",
            "--service",
            "api-*",
            "--users",
            "5",
            "--run-time",
            "2m",
            "--no-save",
        ])
        .expect("parse");
        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };
        assert_eq!(args.session.services, vec!["api-*"]);
        assert_eq!(args.users, Some(5));
        assert_eq!(args.run_time, Some(Duration::from_secs(120)));
        assert!(args.session.no_save);
        assert_eq!(args.session.min_severity, Severity::Low);
    }

    #[test]
    fn run_time_accepts_compound_durations_and_rejects_garbage() {
        let cli = Cli::try_parse_from(["svcprobe", "load", "--run-time", "1h30m"]).expect("parse");
        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };
        assert_eq!(args.run_time, Some(Duration::from_secs(5400)));

        for bad in ["soon", "10x", "-5m"] {
            assert!(
                Cli::try_parse_from(["svcprobe", "load", "--run-time", bad]).is_err(),
                "{bad}"
            );
        }
    }

    #[test]
    fn min_severity_accepts_lowercase() {
        let cli = Cli::try_parse_from(["svcprobe", "security", "--min-severity", "high"])
            .expect("parse");
        let Commands::Security(args) = cli.command else {
            panic!("expected security");
        };
        assert_eq!(args.session.min_severity, Severity::High);
    }

    #[test]
    fn unsupported_shell_is_invalid_args() {
        let err = parse_shell("powershell").expect_err("should fail");
        assert_eq!(crate::exit::exit_code(&err), 2);
        assert!(matches!(parse_shell(" Bash "), Ok(clap_complete::Shell::Bash)));
    }
}
