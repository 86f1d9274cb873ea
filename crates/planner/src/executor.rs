//! Concurrent plan execution.
//!
//! The runner repeatedly promotes steps whose dependencies have completed,
//! launches up to `max_concurrency` of them on a [`JoinSet`], and waits for
//! one to finish. Each step task retries its executor while the step stays
//! Running, then records the outcome under the plan lock and persists it.
//! When nothing is Ready or Running and the plan is not finished the run
//! fails as stalled instead of spinning.

use std::collections::HashSet;
use std::sync::Arc;

use agentloom_agent::{AgentLoop, RunOutcome, TerminationReason};
use agentloom_config::PlannerConfig;
use agentloom_core::event::{AgentEvent, EventBus};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::PlanError;
use crate::model::{Plan, PlanStep, StepStatus};
use crate::store::PlanStore;

/// What a step executor sees besides the step itself.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub plan_id: String,
    /// The task the plan was decomposed from
    pub task: String,
    /// `(step id, result)` of every completed dependency
    pub dependency_results: Vec<(String, String)>,
    /// 1-based attempt number within this launch
    pub attempt: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    /// Whether another attempt may succeed
    pub retryable: bool,
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

/// Carries out one plan step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &PlanStep, context: &StepContext) -> Result<String, StepError>;
}

/// Runs each step as its own agent run.
pub struct AgentStepExecutor {
    agent: Arc<AgentLoop>,
    system_prompt: String,
}

impl AgentStepExecutor {
    pub fn new(agent: Arc<AgentLoop>, system_prompt: impl Into<String>) -> Self {
        Self { agent, system_prompt: system_prompt.into() }
    }
}

#[async_trait]
impl StepExecutor for AgentStepExecutor {
    async fn execute(&self, step: &PlanStep, context: &StepContext) -> Result<String, StepError> {
        let run = self
            .agent
            .run(self.system_prompt.as_str(), step_prompt(step, context))
            .await
            .map_err(|e| StepError::fatal(e.to_string()))?;

        match run.outcome() {
            Some(RunOutcome::Answer { text }) => Ok(text.clone()),
            Some(RunOutcome::Suspended(s)) => Err(StepError::fatal(format!(
                "step needs user input: {}",
                s.question
            ))),
            Some(RunOutcome::Failed(reason)) => match reason {
                TerminationReason::Gateway { .. } | TerminationReason::DeadlineExceeded => {
                    Err(StepError::retryable(reason.to_string()))
                }
                _ => Err(StepError::fatal(reason.to_string())),
            },
            None => Err(StepError::fatal("agent run ended without an outcome")),
        }
    }
}

fn step_prompt(step: &PlanStep, context: &StepContext) -> String {
    let mut prompt = format!(
        "Overall task: {}\n\nCurrent step ({}): {}\n",
        context.task, step.id, step.description
    );
    if !context.dependency_results.is_empty() {
        prompt.push_str("\nResults of earlier steps:\n");
        for (id, result) in &context.dependency_results {
            prompt.push_str(&format!("- {id}: {result}\n"));
        }
    }
    prompt.push_str("\nComplete only the current step and answer with its result.");
    prompt
}

/// Shared by the scheduling loop and every step task.
#[derive(Clone)]
struct Worker {
    executor: Arc<dyn StepExecutor>,
    store: Arc<dyn PlanStore>,
    event_bus: Option<Arc<EventBus>>,
    max_attempts: u32,
}

impl Worker {
    fn transition(&self, plan: &mut Plan, id: &str, from: StepStatus, to: StepStatus) -> Result<(), PlanError> {
        plan.transition(id, from, to)?;
        self.announce(plan, id, from, to);
        Ok(())
    }

    fn announce(&self, plan: &Plan, id: &str, from: StepStatus, to: StepStatus) {
        debug!(plan_id = %plan.id, step = id, %from, %to, "Step transition");
        if let Some(bus) = &self.event_bus {
            bus.publish(AgentEvent::PlanStepTransition {
                plan_id: plan.id.clone(),
                step_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Attempt a Running step until it succeeds, fails for good or runs
    /// out of attempts, then record the outcome.
    async fn run_step(&self, shared: Arc<Mutex<Plan>>, step: PlanStep, context: StepContext) -> Result<(), PlanError> {
        let id = step.id.clone();
        let step = Arc::new(step);
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            let executor = self.executor.clone();
            let current = step.clone();
            let ctx = StepContext { attempt, ..context.clone() };
            // Spawned so a panicking executor fails the step, not the runner.
            let result = match tokio::spawn(async move { executor.execute(&current, &ctx).await }).await {
                Ok(result) => result,
                Err(e) => Err(StepError::fatal(format!("step executor panicked: {e}"))),
            };
            shared.lock().await.record_attempt(&id)?;

            match result {
                Ok(output) => break Ok(output),
                Err(e) if e.retryable && attempt < self.max_attempts => {
                    warn!(step = %id, attempt, error = %e, "Step failed, retrying");
                }
                Err(e) => break Err(e),
            }
        };

        let mut plan = shared.lock().await;
        match outcome {
            Ok(output) => {
                plan.mark_completed(&id, output)?;
                self.announce(&plan, &id, StepStatus::Running, StepStatus::Completed);
                info!(plan_id = %plan.id, step = %id, attempts = attempt, "Step completed");
            }
            Err(e) => {
                plan.mark_failed(&id, e.message.clone())?;
                self.announce(&plan, &id, StepStatus::Running, StepStatus::Failed);
                warn!(plan_id = %plan.id, step = %id, attempts = attempt, error = %e, "Step failed");
            }
        }
        self.store.save(&plan).await
    }
}

/// Executes a plan's steps in dependency order.
pub struct PlanRunner {
    worker: Worker,
    max_concurrency: usize,
}

impl PlanRunner {
    pub fn new(executor: Arc<dyn StepExecutor>, store: Arc<dyn PlanStore>) -> Self {
        Self::from_config(&PlannerConfig::default(), executor, store)
    }

    pub fn from_config(config: &PlannerConfig, executor: Arc<dyn StepExecutor>, store: Arc<dyn PlanStore>) -> Self {
        Self {
            worker: Worker {
                executor,
                store,
                event_bus: None,
                max_attempts: config.max_step_attempts.max(1),
            },
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.worker.event_bus = Some(bus);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_max_step_attempts(mut self, max: u32) -> Self {
        self.worker.max_attempts = max.max(1);
        self
    }

    /// Load a stored plan and carry on. Steps found Running were interrupted
    /// and run again.
    pub async fn resume(&self, plan_id: &str) -> Result<Plan, PlanError> {
        let plan = self
            .worker
            .store
            .load(plan_id)
            .await?
            .ok_or_else(|| PlanError::NotFound(plan_id.to_string()))?;
        info!(plan_id, "Resuming plan");
        self.run(plan).await
    }

    /// Execute until every step is Completed or Failed.
    ///
    /// Returns the final plan, which may contain Failed steps with no
    /// dependents. Fails with `Cycle` before executing anything if the graph
    /// is cyclic, and with `Stalled` when failures leave steps unreachable.
    pub async fn run(&self, plan: Plan) -> Result<Plan, PlanError> {
        plan.check_acyclic().inspect_err(|e| {
            warn!(plan_id = %plan.id, error = %e, "Refusing to run cyclic plan");
        })?;
        self.worker.store.save(&plan).await?;
        info!(plan_id = %plan.id, steps = plan.steps.len(), "Plan execution started");

        let shared = Arc::new(Mutex::new(plan));
        let mut tasks: JoinSet<(String, Result<(), PlanError>)> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        loop {
            {
                let mut plan = shared.lock().await;
                self.schedule(&mut plan, &shared, &mut tasks, &mut in_flight).await?;

                if in_flight.is_empty() {
                    if plan.is_finished() {
                        info!(
                            plan_id = %plan.id,
                            failed = plan.steps_with_status(StepStatus::Failed).len(),
                            "Plan execution finished"
                        );
                        break;
                    }
                    let stalled = plan
                        .stall()?
                        .unwrap_or_else(|| PlanError::Internal("no runnable steps".into()));
                    warn!(plan_id = %plan.id, error = %stalled, "Plan stalled");
                    return Err(stalled);
                }
            }

            match tasks.join_next().await {
                Some(Ok((id, result))) => {
                    in_flight.remove(&id);
                    result?;
                }
                Some(Err(e)) => return Err(PlanError::Internal(format!("step task failed: {e}"))),
                None => {}
            }
        }

        let plan = shared.lock().await.clone();
        Ok(plan)
    }

    /// Promote newly ready steps and launch as many as capacity allows.
    async fn schedule(
        &self,
        plan: &mut Plan,
        shared: &Arc<Mutex<Plan>>,
        tasks: &mut JoinSet<(String, Result<(), PlanError>)>,
        in_flight: &mut HashSet<String>,
    ) -> Result<(), PlanError> {
        let ready: Vec<String> = plan.ready_steps()?.iter().map(|s| s.id.clone()).collect();

        let mut changed = false;
        for id in &ready {
            if plan.step(id).is_some_and(|s| s.status == StepStatus::Pending) {
                self.worker.transition(plan, id, StepStatus::Pending, StepStatus::Ready)?;
                changed = true;
            }
        }

        let interrupted = plan
            .steps_with_status(StepStatus::Running)
            .into_iter()
            .map(|s| s.id.clone())
            .filter(|id| !in_flight.contains(id))
            .collect::<Vec<_>>();
        let capacity = self.max_concurrency.saturating_sub(in_flight.len());
        let launch: Vec<String> = interrupted
            .into_iter()
            .chain(ready.into_iter().filter(|id| !in_flight.contains(id)))
            .take(capacity)
            .collect();

        for id in launch {
            match plan.step(&id).map(|s| s.status) {
                Some(StepStatus::Ready) => {
                    self.worker.transition(plan, &id, StepStatus::Ready, StepStatus::Running)?;
                    changed = true;
                }
                Some(StepStatus::Running) => info!(plan_id = %plan.id, step = %id, "Re-running interrupted step"),
                _ => continue,
            }

            let step = plan.step(&id).cloned().ok_or_else(|| PlanError::UnknownStep(id.clone()))?;
            let context = StepContext {
                plan_id: plan.id.clone(),
                task: plan.task.clone(),
                dependency_results: plan.dependency_results(&id),
                attempt: 0,
            };
            let worker = self.worker.clone();
            let shared = shared.clone();
            in_flight.insert(id.clone());
            tasks.spawn(async move {
                let result = worker.run_step(shared, step, context).await;
                (id, result)
            });
        }

        if changed {
            self.worker.store.save(plan).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPlanStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records execution order, fails configured steps a number of times.
    #[derive(Default)]
    struct Recorder {
        order: std::sync::Mutex<Vec<String>>,
        failures: std::sync::Mutex<HashMap<String, (u32, bool)>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl Recorder {
        fn failing(self, id: &str, times: u32, retryable: bool) -> Self {
            self.failures.lock().unwrap().insert(id.into(), (times, retryable));
            self
        }

        fn order(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepExecutor for Recorder {
        async fn execute(&self, step: &PlanStep, context: &StepContext) -> Result<String, StepError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            self.order.lock().unwrap().push(step.id.clone());
            let mut failures = self.failures.lock().unwrap();
            if let Some((left, retryable)) = failures.get_mut(&step.id)
                && *left > 0
            {
                *left -= 1;
                let message = format!("{} broke on attempt {}", step.id, context.attempt);
                return Err(if *retryable {
                    StepError::retryable(message)
                } else {
                    StepError::fatal(message)
                });
            }
            let inputs: Vec<_> = context.dependency_results.iter().map(|(id, _)| id.as_str()).collect();
            Ok(format!("{} done (inputs: {})", step.id, inputs.join(",")))
        }
    }

    fn diamond() -> Plan {
        Plan::new(
            "release",
            vec![
                PlanStep::new("a", "prepare"),
                PlanStep::new("b", "left").with_dependency("a"),
                PlanStep::new("c", "right").with_dependency("a"),
                PlanStep::new("d", "join").with_dependencies(["b", "c"]),
            ],
        )
        .unwrap()
    }

    fn runner(executor: Arc<Recorder>, store: Arc<InMemoryPlanStore>) -> PlanRunner {
        PlanRunner::new(executor, store)
    }

    #[tokio::test]
    async fn runs_steps_in_dependency_order() {
        let executor = Arc::new(Recorder::default());
        let store = Arc::new(InMemoryPlanStore::new());
        let plan = runner(executor.clone(), store.clone()).run(diamond()).await.unwrap();

        assert!(plan.is_successful());
        let order = executor.order();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert_eq!(
            plan.step("d").unwrap().result.as_deref(),
            Some("d done (inputs: b,c)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn independent_steps_run_concurrently_within_limit() {
        let steps = (0..6).map(|i| PlanStep::new(format!("s{i}"), "work")).collect();
        let plan = Plan::new("fan out", steps).unwrap();
        let executor = Arc::new(Recorder {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let store = Arc::new(InMemoryPlanStore::new());

        runner(executor.clone(), store)
            .with_max_concurrency(3)
            .run(plan)
            .await
            .unwrap();
        assert_eq!(executor.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_while_running() {
        let executor = Arc::new(Recorder::default().failing("b", 1, true));
        let store = Arc::new(InMemoryPlanStore::new());
        let plan = runner(executor.clone(), store.clone())
            .with_max_step_attempts(2)
            .run(diamond())
            .await
            .unwrap();

        assert!(plan.is_successful());
        assert_eq!(plan.step("b").unwrap().attempts, 2);
        // No snapshot ever shows "b" leaving Running between attempts.
        let history = store.history().await;
        let b_states: Vec<StepStatus> = history.iter().map(|p| p.step("b").unwrap().status).collect();
        assert!(!b_states.windows(2).any(|w| w[0] == StepStatus::Running && w[1] == StepStatus::Ready));
    }

    #[tokio::test]
    async fn fatal_failure_stalls_dependents() {
        let executor = Arc::new(Recorder::default().failing("b", 1, false));
        let store = Arc::new(InMemoryPlanStore::new());
        let err = runner(executor.clone(), store.clone()).run(diamond()).await.unwrap_err();

        match err {
            PlanError::Stalled { blocked, failed } => {
                assert_eq!(blocked, vec!["d"]);
                assert_eq!(failed, vec!["b"]);
            }
            other => panic!("expected stall, got {other:?}"),
        }
        assert!(!executor.order().contains(&"d".to_string()));

        // The failure was persisted before the run gave up.
        let saved = store.history().await.last().cloned().unwrap();
        assert_eq!(saved.step("b").unwrap().status, StepStatus::Failed);
        assert_eq!(saved.step("c").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn failed_leaf_still_finishes() {
        let executor = Arc::new(Recorder::default().failing("d", 5, true));
        let store = Arc::new(InMemoryPlanStore::new());
        let plan = runner(executor, store)
            .with_max_step_attempts(3)
            .run(diamond())
            .await
            .unwrap();

        assert!(plan.is_finished());
        assert!(!plan.is_successful());
        let d = plan.step("d").unwrap();
        assert_eq!(d.status, StepStatus::Failed);
        assert_eq!(d.attempts, 3);
        assert!(d.error.as_deref().unwrap().contains("attempt 3"));
    }

    #[tokio::test]
    async fn every_transition_is_persisted() {
        let plan = Plan::new("one", vec![PlanStep::new("only", "do it")]).unwrap();
        let store = Arc::new(InMemoryPlanStore::new());
        runner(Arc::new(Recorder::default()), store.clone())
            .run(plan)
            .await
            .unwrap();

        let statuses: Vec<StepStatus> = store
            .history()
            .await
            .iter()
            .map(|p| p.step("only").unwrap().status)
            .collect();
        assert_eq!(statuses.first(), Some(&StepStatus::Pending));
        assert!(statuses.contains(&StepStatus::Running));
        assert_eq!(statuses.last(), Some(&StepStatus::Completed));
    }

    #[tokio::test]
    async fn resume_reruns_interrupted_step() {
        let mut plan = diamond();
        for id in ["a"] {
            plan.mark_ready(id).unwrap();
            plan.mark_running(id).unwrap();
            plan.mark_completed(id, "a done").unwrap();
        }
        // Crashed while "b" was running.
        plan.mark_ready("b").unwrap();
        plan.mark_running("b").unwrap();

        let store = Arc::new(InMemoryPlanStore::new());
        store.save(&plan).await.unwrap();
        let executor = Arc::new(Recorder::default());

        let finished = runner(executor.clone(), store).resume(&plan.id).await.unwrap();
        assert!(finished.is_successful());
        let order = executor.order();
        assert!(!order.contains(&"a".to_string()));
        assert!(order.contains(&"b".to_string()));
        assert_eq!(order.len(), 3);
    }

    #[tokio::test]
    async fn resume_of_unknown_plan_fails() {
        let store = Arc::new(InMemoryPlanStore::new());
        let err = runner(Arc::new(Recorder::default()), store).resume("nope").await.unwrap_err();
        assert!(matches!(err, PlanError::NotFound(_)));
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let plan = Plan::new("one", vec![PlanStep::new("only", "do it")]).unwrap();
        runner(Arc::new(Recorder::default()), Arc::new(InMemoryPlanStore::new()))
            .with_event_bus(bus)
            .run(plan)
            .await
            .unwrap();

        let mut moves = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::PlanStepTransition { from, to, .. } = event.as_ref() {
                moves.push(format!("{from}->{to}"));
            }
        }
        assert_eq!(moves, vec!["pending->ready", "ready->running", "running->completed"]);
    }

    #[test]
    fn prompt_includes_dependency_results() {
        let step = PlanStep::new("summarize", "Summarize the logs").with_dependency("fetch");
        let context = StepContext {
            plan_id: "p".into(),
            task: "Report errors".into(),
            dependency_results: vec![("fetch".into(), "42 errors".into())],
            attempt: 1,
        };
        let prompt = step_prompt(&step, &context);
        assert!(prompt.contains("Overall task: Report errors"));
        assert!(prompt.contains("- fetch: 42 errors"));
    }
}
