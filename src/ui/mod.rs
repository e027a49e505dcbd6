use anyhow::Error;
use std::io::{self, Write};
use unicode_width::UnicodeWidthChar;

use crate::core::{ClassifiedFinding, Severity};
use crate::engine::Liveness;
use crate::report::{SavedReport, StructuredReport};
use crate::session::SessionStatus;

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub max_table_rows: usize,
    pub min_severity: Severity,
    pub quiet: bool,
    /// Lifts the `max_table_rows` cap on findings and recommendations.
    pub verbose: bool,
}

impl UiConfig {
    fn row_limit(&self) -> usize {
        if self.verbose {
            usize::MAX
        } else {
            self.max_table_rows
        }
    }
}

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "エラー:");
    let _ = writeln!(stderr, "  {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "原因:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "次に:");
    let _ = writeln!(
        stderr,
        "  - 詳細を見るには `--verbose` を付けて再実行してください"
    );
    let _ = writeln!(
        stderr,
        "  - 利用可能なコマンド/オプションは `svcprobe --help` を参照してください"
    );
}

pub fn print_session(report: &StructuredReport, cfg: &UiConfig, saved: Option<&SavedReport>) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    write_session(&mut out, report, cfg, saved);
}

fn write_session(
    out: &mut dyn Write,
    report: &StructuredReport,
    cfg: &UiConfig,
    saved: Option<&SavedReport>,
) {
    let status = match report.status {
        SessionStatus::Complete => "完了",
        SessionStatus::Incomplete => "中断（部分結果）",
        SessionStatus::Running => "実行中",
    };
    let _ = writeln!(
        out,
        "セッション: {}  モード={}  状態={}  ターゲット={}",
        report.session_id,
        report.mode,
        status,
        report.targets.len()
    );
    let s = &report.summary;
    let _ = writeln!(
        out,
        "概要: {}={}  {}={}  {}={}  {}={}  合計={}",
        format_severity(Severity::High, cfg.color),
        s.high,
        format_severity(Severity::Medium, cfg.color),
        s.medium,
        format_severity(Severity::Low, cfg.color),
        s.low,
        format_severity(Severity::Info, cfg.color),
        s.info,
        s.total
    );
    for note in &report.notes {
        let _ = writeln!(out, "- {note}");
    }

    let shown: Vec<&ClassifiedFinding> = report
        .findings
        .iter()
        .filter(|f| f.severity >= cfg.min_severity)
        .collect();
    let rows = cfg.row_limit().min(shown.len());
    let _ = writeln!(out);
    if shown.is_empty() {
        let _ = writeln!(out, "{} 以上の所見はありません。", cfg.min_severity);
    } else {
        if shown.len() > rows {
            let _ = writeln!(out, "所見（{rows}件表示 / 全{}件）:", shown.len());
        } else {
            let _ = writeln!(out, "所見（{rows}件表示）:");
        }
        let mut sorted = shown;
        sorted.sort_by_key(|f| std::cmp::Reverse(f.severity));
        print_findings_table(out, &sorted, rows, cfg.color);
    }

    if !report.recommendations.is_empty() {
        let _ = writeln!(out);
        let show = report.recommendations.len().min(cfg.row_limit().max(1));
        if report.recommendations.len() > show {
            let _ = writeln!(
                out,
                "推奨事項（{show}件表示 / 全{}件）:",
                report.recommendations.len()
            );
        } else {
            let _ = writeln!(out, "推奨事項（{show}件表示）:");
        }
        for rec in report.recommendations.iter().take(show) {
            let _ = writeln!(
                out,
                "- [{}] {}（{}）",
                format_severity(rec.severity, cfg.color),
                rec.message,
                rec.affected_targets.join(", ")
            );
        }
        if report.recommendations.len() > show {
            let _ = writeln!(out, "- ...（残り{}件）", report.recommendations.len() - show);
        }
    }

    if let Some(stats) = &report.request_stats {
        let _ = writeln!(out);
        let t = &stats.total;
        let _ = writeln!(
            out,
            "リクエスト: 件数={}  失敗={}  平均={:.1}ms  p95={:.1}ms  {:.2} req/s",
            t.count, t.failures, t.avg_ms, t.p95_ms, stats.requests_per_second
        );
    }

    if let Some(saved) = saved {
        let _ = writeln!(out);
        let _ = writeln!(out, "レポート: {}", saved.json.display());
        let _ = writeln!(out, "          {}", saved.markdown.display());
    }
}

pub fn print_targets(targets: &[Liveness], checked: bool, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    write_targets(&mut out, targets, checked, cfg.color);
}

fn write_targets(out: &mut dyn Write, targets: &[Liveness], checked: bool, color: bool) {
    let label_id = "ID";
    let label_url = "ヘルスチェック URL";
    let id_w = targets
        .iter()
        .map(|l| visible_width_ansi(&l.target.id))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_id));
    let url_w = targets
        .iter()
        .map(|l| visible_width_ansi(&l.target.liveness_url()))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_url));

    if checked {
        let _ = writeln!(
            out,
            "{}  {}  状態",
            pad_end_display(label_id, id_w),
            pad_end_display(label_url, url_w)
        );
        let _ = writeln!(out, "{}  {}  ----", "-".repeat(id_w), "-".repeat(url_w));
    } else {
        let _ = writeln!(out, "{}  {}", pad_end_display(label_id, id_w), label_url);
        let _ = writeln!(out, "{}  {}", "-".repeat(id_w), "-".repeat(url_w));
    }
    for live in targets {
        let id = pad_end_display(&live.target.id, id_w);
        let url = live.target.liveness_url();
        if !checked {
            let _ = writeln!(out, "{id}  {url}");
            continue;
        }
        let state = match (live.status, &live.error) {
            (Some(200), _) => paint("UP", "32", color),
            (Some(code), _) => paint(&format!("DOWN (HTTP {code})"), "31", color),
            (None, Some(err)) => paint(&format!("DOWN ({})", truncate_middle(err, 60)), "31", color),
            (None, None) => paint("DOWN", "31", color),
        };
        let _ = writeln!(out, "{id}  {}  {state}", pad_end_display(&url, url_w));
    }
}

fn print_findings_table(
    out: &mut dyn Write,
    findings: &[&ClassifiedFinding],
    rows: usize,
    color: bool,
) {
    let label_sev = "重大度";
    let label_cat = "カテゴリ";
    let label_target = "ターゲット";
    let label_check = "チェック";

    let sev_w = visible_width_ansi(label_sev).max(6);
    let cat_w = findings
        .iter()
        .take(rows)
        .map(|f| visible_width_ansi(&f.category))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_cat));
    let target_w = findings
        .iter()
        .take(rows)
        .map(|f| visible_width_ansi(&f.outcome.target))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_target));
    let check_w = visible_width_ansi(label_check).max(5);

    let _ = writeln!(
        out,
        "{}  {}  {}  {}",
        pad_end_display(label_sev, sev_w),
        pad_end_display(label_cat, cat_w),
        pad_end_display(label_target, target_w),
        label_check
    );
    let _ = writeln!(
        out,
        "{}  {}  {}  {}",
        "-".repeat(sev_w),
        "-".repeat(cat_w),
        "-".repeat(target_w),
        "-".repeat(check_w)
    );

    for f in findings.iter().take(rows) {
        let sev = pad_end_ansi(&format_severity(f.severity, color), sev_w);
        let cat = pad_end_display(&f.category, cat_w);
        let target = pad_end_display(&f.outcome.target, target_w);
        let check = match &f.outcome.error {
            Some(err) => format!("{}: {}", f.outcome.name, truncate_middle(err, 80)),
            None => f.outcome.name.clone(),
        };
        let _ = writeln!(out, "{sev}  {cat}  {target}  {check}");
    }
}

fn format_severity(severity: Severity, color: bool) -> String {
    let code = match severity {
        Severity::High => "31",
        Severity::Medium => "33",
        Severity::Low => "36",
        Severity::Info => "90",
    };
    paint(severity.as_str(), code, color)
}

fn paint(s: &str, code: &str, color: bool) -> String {
    if !color {
        return s.to_string();
    }
    format!("\x1b[{code}m{s}\x1b[0m")
}

fn truncate_middle(s: &str, max_chars: usize) -> String {
    let len = s.chars().count();
    if len <= max_chars {
        return s.to_string();
    }

    let keep = max_chars.saturating_sub(3);
    let left = keep / 2;
    let right = keep.saturating_sub(left);

    let prefix: String = s.chars().take(left).collect();
    let suffix: String = s.chars().skip(len - right).collect();

    format!("{prefix}...{suffix}")
}

fn pad_end_ansi(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn pad_end_display(s: &str, width: usize) -> String {
    pad_end_ansi(s, width)
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width = width.saturating_add(UnicodeWidthChar::width(ch).unwrap_or(0));
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Detail, FailureKind, Outcome, OutcomeKind, Target};
    use crate::report::to_structured_form;
    use crate::session::{Session, SessionMode};

    fn cfg() -> UiConfig {
        UiConfig {
            color: false,
            max_table_rows: 20,
            min_severity: Severity::Low,
            quiet: false,
            verbose: false,
        }
    }

    #[test]
    fn width_ignores_ansi_and_counts_wide_chars() {
        assert_eq!(visible_width_ansi("\x1b[31mHIGH\x1b[0m"), 4);
        assert_eq!(visible_width_ansi("重大度"), 6);
    }

    #[test]
    fn truncate_middle_keeps_both_ends() {
        assert_eq!(truncate_middle("abcdefghij", 7), "ab...ij");
        assert_eq!(truncate_middle("short", 10), "short");
    }

    #[test]
    fn session_summary_hides_findings_below_threshold() {
        let mut s = Session::start(
            SessionMode::Security,
            vec![Target::new("user-service", "http://localhost:8700", "/h")],
        )
        .expect("start");
        s.add_outcome(Outcome::succeeded(
            OutcomeKind::Probe,
            "information_disclosure",
            "user-service",
            None,
            Detail::new(),
        ))
        .expect("add");
        s.add_outcome(Outcome::failed(
            OutcomeKind::Probe,
            "http_methods",
            "user-service",
            FailureKind::Timeout,
            "timeout",
        ))
        .expect("add");
        s.finalize(SessionStatus::Incomplete);
        let report = to_structured_form(&s);

        let mut buf = Vec::new();
        write_session(&mut buf, &report, &cfg(), None);
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("状態=中断（部分結果）"));
        assert!(text.contains("LOW=1"));
        assert!(text.contains("INFO=1"));
        assert!(text.contains("所見（1件表示）"));
        assert!(text.contains("http_methods: timeout"));
        assert!(!text.contains("information_disclosure"));
    }

    #[test]
    fn verbose_lifts_the_row_cap() {
        let mut s = Session::start(
            SessionMode::Security,
            vec![Target::new("user-service", "http://localhost:8700", "/h")],
        )
        .expect("start");
        for name in ["security_headers", "http_methods", "authentication"] {
            s.add_outcome(Outcome::failed(
                OutcomeKind::Probe,
                name,
                "user-service",
                FailureKind::Timeout,
                "timeout",
            ))
            .expect("add");
        }
        s.finalize(SessionStatus::Complete);
        let report = to_structured_form(&s);

        let capped = UiConfig {
            max_table_rows: 1,
            ..cfg()
        };
        let mut buf = Vec::new();
        write_session(&mut buf, &report, &capped, None);
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("所見（1件表示 / 全3件）"));
        assert!(!text.contains("authentication: timeout"));

        let verbose = UiConfig {
            verbose: true,
            ..capped
        };
        let mut buf = Vec::new();
        write_session(&mut buf, &report, &verbose, None);
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("所見（3件表示）"));
        assert!(text.contains("authentication: timeout"));
    }

    #[test]
    fn target_table_marks_down_targets() {
        let rows = vec![
            Liveness {
                target: Target::new("a", "http://a.test", "/health"),
                status: Some(200),
                error: None,
            },
            Liveness {
                target: Target::new("b", "http://b.test", "/health"),
                status: Some(503),
                error: None,
            },
        ];
        let mut buf = Vec::new();
        write_targets(&mut buf, &rows, true, false);
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("http://a.test/health"));
        assert!(text.contains("UP"));
        assert!(text.contains("DOWN (HTTP 503)"));
    }
}
