use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{StructuredReport, render_markdown};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedReport {
    pub dir: PathBuf,
    pub json: PathBuf,
    pub markdown: PathBuf,
}

/// Writes `<dir>/<sessionId>/report.json` and `report.md`.
pub fn save_report(report: &StructuredReport, dir: &Path) -> Result<SavedReport> {
    let session_dir = dir.join(sanitize(&report.session_id));
    std::fs::create_dir_all(&session_dir).with_context(|| {
        format!(
            "レポートディレクトリの作成に失敗しました: {}",
            session_dir.display()
        )
    })?;

    let json = session_dir.join("report.json");
    let buf =
        serde_json::to_vec_pretty(report).context("レポート(JSON)のシリアライズに失敗しました")?;
    std::fs::write(&json, buf)
        .with_context(|| format!("レポートの書き込みに失敗しました: {}", json.display()))?;

    let markdown = session_dir.join("report.md");
    std::fs::write(&markdown, render_markdown(report))
        .with_context(|| format!("レポートの書き込みに失敗しました: {}", markdown.display()))?;

    Ok(SavedReport {
        dir: session_dir,
        json,
        markdown,
    })
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect()
}
