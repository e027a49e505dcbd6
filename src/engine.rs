use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::core::Target;
use crate::http::{HttpClient, HttpRequest};
use crate::load::{self, LoadPlan, RunEnd, Workload};
use crate::probes::{self, ProbeUnit};
use crate::session::{
    CancelToken, Session, SessionError, SessionMode, SessionRecorder, SessionStatus,
};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub request_timeout: Duration,
    pub skip_liveness: bool,
    pub show_progress: bool,
}

#[derive(Clone)]
pub struct Engine {
    opts: EngineOptions,
    client: Arc<dyn HttpClient>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    pub target: Target,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl Liveness {
    pub fn is_up(&self) -> bool {
        self.status == Some(200)
    }

    fn describe(&self) -> String {
        match (self.status, &self.error) {
            (_, Some(err)) => err.clone(),
            (Some(status), None) => format!("HTTP {status}"),
            (None, None) => "no response".to_string(),
        }
    }
}

impl Engine {
    pub fn new(opts: EngineOptions, client: Arc<dyn HttpClient>) -> Self {
        Self { opts, client }
    }

    /// Fetches every liveness path concurrently; results keep input order.
    pub async fn liveness(&self, targets: &[Target]) -> Vec<Liveness> {
        let mut set = JoinSet::new();
        for (idx, target) in targets.iter().cloned().enumerate() {
            let client = Arc::clone(&self.client);
            let timeout = self.opts.request_timeout;
            set.spawn(async move {
                let resp = client
                    .request(HttpRequest::get(target.liveness_url(), timeout))
                    .await;
                let (status, error) = match resp {
                    Ok(resp) => (Some(resp.status), None),
                    Err(err) => (None, Some(err.to_string())),
                };
                (idx, Liveness { target, status, error })
            });
        }

        let mut results: Vec<Option<Liveness>> = vec![None; targets.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, live)) => results[idx] = Some(live),
                Err(err) => warn!(error = %err, "liveness check aborted"),
            }
        }
        results
            .into_iter()
            .zip(targets)
            .map(|(live, target)| {
                live.unwrap_or_else(|| Liveness {
                    target: target.clone(),
                    status: None,
                    error: Some("liveness check aborted".to_string()),
                })
            })
            .collect()
    }

    /// Keeps the targets whose liveness path answers 200. No survivor means
    /// the session cannot start.
    async fn reachable(&self, targets: Vec<Target>) -> Result<(Vec<Target>, Vec<String>), SessionError> {
        if targets.is_empty() {
            return Err(SessionError::configuration("ターゲットが 1 件もありません"));
        }
        if self.opts.skip_liveness {
            return Ok((targets, vec!["liveness check skipped".to_string()]));
        }

        let pb = self.spinner("ヘルスチェック中...");
        let checks = self.liveness(&targets).await;
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        let mut up = Vec::new();
        let mut notes = Vec::new();
        for live in checks {
            if live.is_up() {
                up.push(live.target);
                continue;
            }
            warn!(target_id = %live.target.id, reason = %live.describe(), "target excluded: liveness check failed");
            notes.push(format!(
                "target {} excluded: liveness check failed ({})",
                live.target.id,
                live.describe()
            ));
        }
        if up.is_empty() {
            return Err(SessionError::NotStarted(
                "到達可能なターゲットがありません（ヘルスチェックがすべて失敗しました）".to_string(),
            ));
        }
        Ok((up, notes))
    }

    pub async fn security(
        &self,
        targets: Vec<Target>,
        probes: &[Arc<dyn ProbeUnit>],
        cancel: CancelToken,
    ) -> Result<Session, SessionError> {
        if probes.is_empty() {
            return Err(SessionError::configuration("probe が 1 件も選択されていません"));
        }
        let (targets, notes) = self.reachable(targets).await?;
        let mut session = Session::start(SessionMode::Security, targets)?;
        for note in notes {
            session.add_note(note);
        }
        info!(session = %session.id, targets = session.targets.len(), probes = probes.len(), "security session started");

        let snapshot = session.targets.clone();
        for target in &snapshot {
            if cancel.is_cancelled() {
                break;
            }
            let pb = self.spinner(&format!("セキュリティ検査中 {}", target.id));
            let outcomes =
                probes::run_all_until(target, probes, Arc::clone(&self.client), &cancel).await;
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            for outcome in outcomes {
                session.add_outcome(outcome)?;
            }
        }

        let status = if cancel.is_cancelled() {
            session.add_note("session interrupted by operator; results are partial");
            SessionStatus::Incomplete
        } else {
            SessionStatus::Complete
        };
        session.finalize(status);
        info!(session = %session.id, findings = session.findings.len(), status = ?session.status, "security session finished");
        Ok(session)
    }

    pub async fn load(
        &self,
        targets: Vec<Target>,
        workload: Arc<Workload>,
        plan: &LoadPlan,
        cancel: CancelToken,
    ) -> Result<Session, SessionError> {
        let (targets, notes) = self.reachable(targets).await?;
        let mut session = Session::start(SessionMode::Load, targets.clone())?;
        for note in notes {
            session.add_note(note);
        }
        session.add_note(format!(
            "load: users={} spawn_rate={}/s run_time={}",
            plan.users,
            plan.spawn_rate,
            humantime::format_duration(plan.run_time)
        ));
        info!(session = %session.id, targets = targets.len(), "load session started");

        let recorder = SessionRecorder::new(session);
        let pb = self.spinner(&format!("負荷試験中（{} ユーザー）", plan.users));
        let run = load::run(
            plan,
            &targets,
            workload,
            Arc::clone(&self.client),
            &recorder,
            cancel,
        )
        .await;
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        let run = run?;

        recorder
            .note(format!(
                "load: actors_started={} behaviors_run={}",
                run.actors_started, run.behaviors_run
            ))
            .await;
        let status = match run.end {
            RunEnd::Completed => SessionStatus::Complete,
            RunEnd::Cancelled => {
                recorder
                    .note("session interrupted by operator; results are partial")
                    .await;
                SessionStatus::Incomplete
            }
        };
        let session = recorder.finish(status).await;
        info!(session = %session.id, findings = session.findings.len(), status = ?session.status, "load session finished");
        Ok(session)
    }

    fn spinner(&self, message: &str) -> Option<indicatif::ProgressBar> {
        use std::io::IsTerminal;
        if !self.opts.show_progress || !std::io::stderr().is_terminal() {
            return None;
        }
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, TransportError};
    use crate::probes::fake::FakeClient;
    use crate::probes::{ProbeSettings, SECURITY_HEADERS, TRANSPORT_SECURITY, build_probes};
    use crate::session::cancel_pair;

    fn opts() -> EngineOptions {
        EngineOptions {
            request_timeout: Duration::from_secs(1),
            skip_liveness: false,
            show_progress: false,
        }
    }

    fn targets() -> Vec<Target> {
        vec![
            Target::new("up", "http://up.test", "/health"),
            Target::new("down", "http://down.test", "/health"),
        ]
    }

    fn client() -> Arc<dyn HttpClient> {
        Arc::new(
            FakeClient::new()
                .route("GET", "http://up.test/health", |_| Ok(HttpResponse::new(200)))
                .route("GET", "http://down.test/health", |_| {
                    Err(TransportError::Connect("refused".to_string()))
                }),
        )
    }

    fn probes() -> Vec<Arc<dyn ProbeUnit>> {
        build_probes(
            &[SECURITY_HEADERS.to_string(), TRANSPORT_SECURITY.to_string()],
            &ProbeSettings::default(),
        )
        .expect("probes")
    }

    #[tokio::test]
    async fn unreachable_targets_are_noted_and_skipped() {
        let engine = Engine::new(opts(), client());
        let session = engine
            .security(targets(), &probes(), CancelToken::never())
            .await
            .expect("session");
        assert_eq!(session.status, SessionStatus::Complete);
        assert_eq!(session.targets.len(), 1);
        assert_eq!(session.findings.len(), 2);
        assert!(session.findings.iter().all(|f| f.outcome.target == "up"));
        assert!(session.notes.iter().any(|n| n.contains("target down excluded")));
    }

    #[tokio::test]
    async fn no_reachable_target_does_not_start() {
        let engine = Engine::new(opts(), client());
        let err = engine
            .security(vec![targets().remove(1)], &probes(), CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotStarted(_)));
    }

    #[tokio::test]
    async fn skip_liveness_keeps_every_target() {
        let engine = Engine::new(
            EngineOptions {
                skip_liveness: true,
                ..opts()
            },
            client(),
        );
        let session = engine
            .security(targets(), &probes(), CancelToken::never())
            .await
            .expect("session");
        assert_eq!(session.targets.len(), 2);
        assert_eq!(session.findings.len(), 4);
    }

    #[tokio::test]
    async fn cancelled_security_session_is_incomplete() {
        let engine = Engine::new(opts(), client());
        let (handle, token) = cancel_pair();
        handle.cancel();
        let session = engine
            .security(targets(), &probes(), token)
            .await
            .expect("session");
        assert_eq!(session.status, SessionStatus::Incomplete);
        assert!(session.findings.is_empty());
        assert_eq!(session.summary.total, 0);
    }

    #[tokio::test]
    async fn liveness_preserves_input_order() {
        let engine = Engine::new(opts(), client());
        let checks = engine.liveness(&targets()).await;
        assert_eq!(checks[0].target.id, "up");
        assert!(checks[0].is_up());
        assert_eq!(checks[1].target.id, "down");
        assert_eq!(checks[1].error.as_deref(), Some("connection failed: refused"));
    }
}
