use std::sync::Arc;

use tracing::{debug, warn};

use super::{ProbeError, ProbeUnit};
use crate::core::{FailureKind, Outcome, OutcomeKind, Target};
use crate::http::HttpClient;
use crate::session::CancelToken;

/// Runs every probe against `target` in order, one Outcome per probe.
pub async fn run_all(
    target: &Target,
    probes: &[Arc<dyn ProbeUnit>],
    client: Arc<dyn HttpClient>,
) -> Vec<Outcome> {
    run_all_until(target, probes, client, &CancelToken::never()).await
}

/// Like [`run_all`], but stops before the next probe once `cancel` fires.
/// A probe already running is allowed to finish.
pub async fn run_all_until(
    target: &Target,
    probes: &[Arc<dyn ProbeUnit>],
    client: Arc<dyn HttpClient>,
    cancel: &CancelToken,
) -> Vec<Outcome> {
    let mut outcomes = Vec::with_capacity(probes.len());
    for probe in probes {
        if cancel.is_cancelled() {
            debug!(target_id = %target.id, remaining = probes.len() - outcomes.len(), "probe run cancelled");
            break;
        }
        outcomes.push(run_one(target, Arc::clone(probe), Arc::clone(&client)).await);
    }
    outcomes
}

async fn run_one(
    target: &Target,
    probe: Arc<dyn ProbeUnit>,
    client: Arc<dyn HttpClient>,
) -> Outcome {
    let name = probe.name().to_string();
    let limit = probe.timeout();
    let owned = target.clone();
    let mut handle =
        tokio::spawn(async move { probe.run(&owned, client.as_ref()).await });

    let outcome = match tokio::time::timeout(limit, &mut handle).await {
        Err(_) => {
            handle.abort();
            Outcome::failed(OutcomeKind::Probe, &name, &target.id, FailureKind::Timeout, "timeout")
        }
        Ok(Err(join)) => Outcome::failed(
            OutcomeKind::Probe,
            &name,
            &target.id,
            FailureKind::Panic,
            format!("probe aborted: {join}"),
        ),
        Ok(Ok(Ok(report))) => Outcome::succeeded(
            OutcomeKind::Probe,
            &name,
            &target.id,
            report.status_code,
            report.detail,
        ),
        Ok(Ok(Err(ProbeError::Transport(err)))) => {
            let kind = if err.is_timeout() {
                FailureKind::Timeout
            } else {
                FailureKind::Transport
            };
            Outcome::failed(OutcomeKind::Probe, &name, &target.id, kind, err.to_string())
        }
        Ok(Ok(Err(ProbeError::Logic { message, raw }))) => Outcome::failed(
            OutcomeKind::Probe,
            &name,
            &target.id,
            FailureKind::ProbeLogic,
            format!("unexpected response: {message}"),
        )
        .with_detail(raw),
    };

    if outcome.success {
        debug!(target_id = %target.id, probe = %name, "probe completed");
    } else {
        warn!(
            target_id = %target.id,
            probe = %name,
            error = outcome.error.as_deref().unwrap_or_default(),
            "probe failed"
        );
    }
    outcome
}
