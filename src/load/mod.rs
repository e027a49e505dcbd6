mod behaviors;
mod profile;
mod template;
mod workload;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, warn};

use crate::behavior::ActionContext;
use crate::core::Target;
use crate::http::HttpClient;
use crate::session::{CancelToken, SessionError, SessionRecorder, cancel_pair};

pub use behaviors::{BehaviorSpec, HttpBehavior, RequestSpec, build_behaviors, default_behaviors};
pub use profile::{DEFAULT_PROFILE, LoadProfile, PROFILES, profile, profile_names};
pub use template::Template;
pub use workload::{
    ActorProfile, ActorProfileSpec, MixSpec, Workload, default_actor_profiles, default_mixes,
    mix_for,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    pub users: u32,
    pub spawn_rate: u32,
    pub run_time: Duration,
}

impl LoadPlan {
    pub fn new(users: u32, spawn_rate: u32, run_time: Duration) -> Result<Self, SessionError> {
        if users == 0 {
            return Err(SessionError::configuration("users は 1 以上にしてください"));
        }
        if spawn_rate == 0 {
            return Err(SessionError::configuration("spawn_rate は 1 以上にしてください"));
        }
        if run_time.is_zero() {
            return Err(SessionError::configuration("run_time は 0 より大きくしてください"));
        }
        Ok(Self {
            users,
            spawn_rate,
            run_time,
        })
    }

    pub fn spawn_interval(&self) -> Duration {
        Duration::from_secs(1) / self.spawn_rate.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRun {
    pub end: RunEnd,
    pub actors_started: u32,
    pub behaviors_run: u64,
}

struct Actor {
    id: u32,
    target: Target,
    workload: Arc<Workload>,
    client: Arc<dyn HttpClient>,
    recorder: SessionRecorder,
    stop: CancelToken,
}

impl Actor {
    async fn run(mut self) -> Result<(), SessionError> {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let workload = Arc::clone(&self.workload);
        let profile = workload.pick_profile(&mut rng);
        let behaviors = workload.behaviors_for(&self.target);
        debug!(actor = self.id, profile = %profile.name, target_id = %self.target.id, "actor started");

        let mut done = 0u64;
        while !self.stop.is_cancelled() {
            let behavior = behaviors.select(&mut rng);
            let ctx = ActionContext {
                target: &self.target,
                client: self.client.as_ref(),
                actor: self.id,
                behavior: &behavior.name,
            };
            let mut outcome = behavior.action.run(&ctx).await.with_actor(self.id);
            outcome
                .detail
                .insert("actor_profile".to_string(), profile.name.clone().into());
            self.recorder.record(outcome).await?;
            done += 1;

            let wait = profile.think_time(behavior, &mut rng);
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }
        debug!(actor = self.id, behaviors = done, "actor stopped");
        Ok(())
    }
}

/// Ramps actors up at `spawn_rate` per second until `users` run, then lets
/// them loop until `run_time` elapses or `cancel` fires. Actor `i` drives
/// `targets[i % targets.len()]` with the behavior table the workload holds
/// for that target. In-flight behaviors always finish.
pub async fn run(
    plan: &LoadPlan,
    targets: &[Target],
    workload: Arc<Workload>,
    client: Arc<dyn HttpClient>,
    recorder: &SessionRecorder,
    mut cancel: CancelToken,
) -> Result<LoadRun, SessionError> {
    if targets.is_empty() {
        return Err(SessionError::configuration("ターゲットが 1 件もありません"));
    }

    let (stop, stop_token) = cancel_pair();
    let start = Instant::now();
    let deadline = start + plan.run_time;
    let interval = plan.spawn_interval();
    let recorded_before = recorder.len().await;
    let mut actors: JoinSet<Result<(), SessionError>> = JoinSet::new();
    let mut actor_ids: HashMap<task::Id, u32> = HashMap::new();
    let mut spawned = 0u32;
    let mut end = RunEnd::Completed;
    let mut failure: Option<SessionError> = None;

    info!(users = plan.users, spawn_rate = plan.spawn_rate, run_time = %humantime::format_duration(plan.run_time), "load run started");
    loop {
        let next_spawn = start + interval * spawned;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                end = RunEnd::Cancelled;
                break;
            }
            _ = sleep_until(deadline) => break,
            Some(joined) = actors.join_next_with_id(), if !actors.is_empty() => {
                if let Err(err) = collect(joined, &actor_ids) {
                    failure = Some(err);
                    break;
                }
            }
            _ = sleep_until(next_spawn), if spawned < plan.users => {
                let target = targets[spawned as usize % targets.len()].clone();
                debug!(actor = spawned, target_id = %target.id, "actor spawned");
                let handle = actors.spawn(
                    Actor {
                        id: spawned,
                        target,
                        workload: Arc::clone(&workload),
                        client: Arc::clone(&client),
                        recorder: recorder.clone(),
                        stop: stop_token.clone(),
                    }
                    .run(),
                );
                actor_ids.insert(handle.id(), spawned);
                spawned += 1;
            }
        }
    }

    stop.cancel();
    while let Some(joined) = actors.join_next_with_id().await {
        if let Err(err) = collect(joined, &actor_ids) {
            failure.get_or_insert(err);
        }
    }
    if let Some(err) = failure {
        return Err(err);
    }

    let behaviors_run = recorder.len().await.saturating_sub(recorded_before) as u64;
    info!(actors = spawned, behaviors = behaviors_run, cancelled = end == RunEnd::Cancelled, "load run finished");
    Ok(LoadRun {
        end,
        actors_started: spawned,
        behaviors_run,
    })
}

/// A panicked or aborted actor is logged and dropped; only session errors
/// end the run.
fn collect(
    joined: Result<(task::Id, Result<(), SessionError>), JoinError>,
    actor_ids: &HashMap<task::Id, u32>,
) -> Result<(), SessionError> {
    match joined {
        Ok((_, result)) => result,
        Err(err) => {
            let actor = actor_ids.get(&err.id()).copied();
            if err.is_panic() {
                error!(actor = ?actor, error = %err, "actor panicked");
            } else {
                warn!(actor = ?actor, error = %err, "actor aborted");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::behavior::{Behavior, BehaviorAction, WeightedSelector};
    use crate::core::{Detail, Outcome, OutcomeKind};
    use crate::probes::fake::FakeClient;
    use crate::session::{Session, SessionMode};

    struct Instant200 {
        calls: AtomicU32,
    }

    #[async_trait]
    impl BehaviorAction for Instant200 {
        async fn run(&self, ctx: &ActionContext<'_>) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Outcome::succeeded(
                OutcomeKind::Behavior,
                ctx.behavior,
                ctx.target.id.clone(),
                Some(200),
                Detail::new(),
            )
        }
    }

    fn workload(wait: Duration) -> Arc<Workload> {
        let action = Arc::new(Instant200 {
            calls: AtomicU32::new(0),
        });
        Arc::new(Workload::uniform(
            WeightedSelector::new(vec![
                Behavior::new("browse", 1, wait, wait, action).expect("behavior"),
            ])
            .expect("selector"),
        ))
    }

    /// Panics on the second behavior of actor 1; everyone else answers 200.
    struct PanicsOnSecondCall {
        calls: AtomicU32,
    }

    #[async_trait]
    impl BehaviorAction for PanicsOnSecondCall {
        async fn run(&self, ctx: &ActionContext<'_>) -> Outcome {
            if ctx.actor == 1 && self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("actor 1 blew up");
            }
            Outcome::succeeded(
                OutcomeKind::Behavior,
                ctx.behavior,
                ctx.target.id.clone(),
                Some(200),
                Detail::new(),
            )
        }
    }

    fn targets() -> Vec<Target> {
        vec![
            Target::new("a", "http://a.test", "/health"),
            Target::new("b", "http://b.test", "/health"),
        ]
    }

    #[test]
    fn plan_rejects_zero_values() {
        assert!(LoadPlan::new(0, 1, Duration::from_secs(1)).is_err());
        assert!(LoadPlan::new(1, 0, Duration::from_secs(1)).is_err());
        assert!(LoadPlan::new(1, 1, Duration::ZERO).is_err());
        assert_eq!(
            LoadPlan::new(10, 4, Duration::from_secs(1)).expect("plan").spawn_interval(),
            Duration::from_millis(250)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn actors_round_robin_over_targets_until_deadline() {
        let recorder = SessionRecorder::new(
            Session::start(SessionMode::Load, targets()).expect("start"),
        );
        let plan = LoadPlan::new(4, 4, Duration::from_secs(10)).expect("plan");
        let run = super::run(
            &plan,
            &targets(),
            workload(Duration::from_secs(3)),
            Arc::new(FakeClient::new()),
            &recorder,
            CancelToken::never(),
        )
        .await
        .expect("run");

        assert_eq!(run.end, RunEnd::Completed);
        assert_eq!(run.actors_started, 4);
        let session = recorder.snapshot().await;
        assert_eq!(session.findings.len() as u64, run.behaviors_run);
        for f in &session.findings {
            assert_eq!(f.outcome.detail["actor_profile"], "standard");
            let actor = f.outcome.actor.expect("actor");
            let expected = if actor % 2 == 0 { "a" } else { "b" };
            assert_eq!(f.outcome.target, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_keeps_outcomes_of_started_actors() {
        let recorder = SessionRecorder::new(
            Session::start(SessionMode::Load, targets()).expect("start"),
        );
        let plan = LoadPlan::new(10, 1, Duration::from_secs(600)).expect("plan");
        let (handle, token) = cancel_pair();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2_500)).await;
            handle.cancel();
        });

        let run = super::run(
            &plan,
            &targets(),
            workload(Duration::from_secs(10)),
            Arc::new(FakeClient::new()),
            &recorder,
            token,
        )
        .await
        .expect("run");

        assert_eq!(run.end, RunEnd::Cancelled);
        assert_eq!(run.actors_started, 3);
        let session = recorder.snapshot().await;
        let mut actors: Vec<u32> = session
            .findings
            .iter()
            .filter_map(|f| f.outcome.actor)
            .collect();
        actors.sort_unstable();
        assert_eq!(actors, vec![0, 1, 2]);
        assert_eq!(session.summary.total, 3);
    }

    #[tokio::test]
    async fn unknown_target_aborts_the_run() {
        let recorder = SessionRecorder::new(
            Session::start(SessionMode::Load, vec![Target::new("only", "http://o.test", "/")])
                .expect("start"),
        );
        let plan = LoadPlan::new(1, 1, Duration::from_secs(60)).expect("plan");
        let err = super::run(
            &plan,
            &targets(),
            workload(Duration::from_millis(1)),
            Arc::new(FakeClient::new()),
            &recorder,
            CancelToken::never(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::UnknownTarget { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_actor_keeps_its_recorded_behaviors_in_the_count() {
        let recorder = SessionRecorder::new(
            Session::start(SessionMode::Load, targets()).expect("start"),
        );
        let wait = Duration::from_secs(1);
        let action = Arc::new(PanicsOnSecondCall {
            calls: AtomicU32::new(0),
        });
        let workload = Arc::new(Workload::uniform(
            WeightedSelector::new(vec![
                Behavior::new("browse", 1, wait, wait, action).expect("behavior"),
            ])
            .expect("selector"),
        ));
        let plan = LoadPlan::new(2, 2, Duration::from_secs(5)).expect("plan");
        let run = super::run(
            &plan,
            &targets(),
            workload,
            Arc::new(FakeClient::new()),
            &recorder,
            CancelToken::never(),
        )
        .await
        .expect("run");

        assert_eq!(run.end, RunEnd::Completed);
        assert_eq!(run.actors_started, 2);
        let session = recorder.snapshot().await;
        let from_actor_1 = session
            .findings
            .iter()
            .filter(|f| f.outcome.actor == Some(1))
            .count();
        assert_eq!(from_actor_1, 1);
        assert_eq!(session.findings.len() as u64, run.behaviors_run);
    }

    #[tokio::test(start_paused = true)]
    async fn actors_use_the_table_of_their_target() {
        let recorder = SessionRecorder::new(
            Session::start(SessionMode::Load, targets()).expect("start"),
        );
        let only_b = MixSpec {
            targets: "b".to_string(),
            users: None,
            spawn_rate: None,
            behaviors: vec![BehaviorSpec {
                name: "b_only".to_string(),
                weight: 1,
                min_wait_ms: 1_000,
                max_wait_ms: 1_000,
                requests: vec![RequestSpec {
                    name: "b".to_string(),
                    method: "GET".to_string(),
                    path: "/b".to_string(),
                    body: None,
                    headers: Default::default(),
                    repeat: None,
                }],
            }],
        };
        let mut fallback = default_behaviors();
        fallback.truncate(1);
        let workload = Workload::build(
            &fallback,
            &[only_b],
            &default_actor_profiles(),
            Duration::from_secs(1),
        )
        .expect("workload");
        let plan = LoadPlan::new(2, 2, Duration::from_secs(3)).expect("plan");
        super::run(
            &plan,
            &targets(),
            Arc::new(workload),
            Arc::new(FakeClient::new()),
            &recorder,
            CancelToken::never(),
        )
        .await
        .expect("run");

        let session = recorder.snapshot().await;
        assert!(!session.findings.is_empty());
        for f in &session.findings {
            let expected = if f.outcome.target == "b" { "b_only" } else { "browse_products" };
            assert_eq!(f.outcome.name, expected);
            assert!(f.outcome.detail["actor_profile"].is_string());
        }
    }
}
