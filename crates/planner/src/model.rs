//! Plans and their steps.
//!
//! A plan is an arena of steps keyed by id; dependencies are id sets, never
//! references. Every status change goes through [`Plan::transition`], which
//! only accepts `Pending → Ready → Running → {Completed | Failed}` and only
//! when the step is currently in the expected state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Ready)
                | (Self::Ready, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,

    /// Ids of steps that must complete first
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Execution attempts so far, across resumes
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: BTreeSet::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// A decomposed task: steps plus their dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// The task this plan was decomposed from
    pub task: String,
    pub steps: BTreeMap<String, PlanStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// Build a plan, rejecting anything that is not a well-formed DAG.
    pub fn new(task: impl Into<String>, steps: Vec<PlanStep>) -> Result<Self, PlanError> {
        if steps.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut map = BTreeMap::new();
        for step in steps {
            if map.contains_key(&step.id) {
                return Err(PlanError::DuplicateStep(step.id));
            }
            map.insert(step.id.clone(), step);
        }

        for step in map.values() {
            if step.dependencies.contains(&step.id) {
                return Err(PlanError::SelfDependency(step.id.clone()));
            }
            if let Some(missing) = step.dependencies.iter().find(|d| !map.contains_key(*d)) {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        if let Some(steps) = graph::find_cycle(&map) {
            return Err(PlanError::Cycle { steps });
        }

        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            steps: map,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace the generated id, e.g. with one already used in events.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.get(id)
    }

    /// Fails with the cycle members if the graph is not acyclic.
    pub fn check_acyclic(&self) -> Result<(), PlanError> {
        match graph::find_cycle(&self.steps) {
            Some(steps) => Err(PlanError::Cycle { steps }),
            None => Ok(()),
        }
    }

    /// Pending or Ready steps whose dependencies have all completed.
    ///
    /// Pure: calling it twice without a transition in between returns the
    /// same steps. The graph is re-checked for cycles every time.
    pub fn ready_steps(&self) -> Result<Vec<&PlanStep>, PlanError> {
        self.check_acyclic()?;
        Ok(self
            .steps
            .values()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::Ready))
            .filter(|s| {
                s.dependencies.iter().all(|d| {
                    self.steps
                        .get(d)
                        .is_some_and(|dep| dep.status == StepStatus::Completed)
                })
            })
            .collect())
    }

    /// Compare-and-set: move `id` from `from` to `to`.
    pub fn transition(&mut self, id: &str, from: StepStatus, to: StepStatus) -> Result<(), PlanError> {
        let step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| PlanError::UnknownStep(id.to_string()))?;
        if step.status != from || !from.can_transition_to(to) {
            return Err(PlanError::InvalidTransition {
                step: id.to_string(),
                actual: step.status,
                from,
                to,
            });
        }

        let now = Utc::now();
        step.status = to;
        step.updated_at = now;
        match to {
            StepStatus::Running => step.started_at = Some(now),
            StepStatus::Completed | StepStatus::Failed => step.finished_at = Some(now),
            _ => {}
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_ready(&mut self, id: &str) -> Result<(), PlanError> {
        self.transition(id, StepStatus::Pending, StepStatus::Ready)
    }

    pub fn mark_running(&mut self, id: &str) -> Result<(), PlanError> {
        self.transition(id, StepStatus::Ready, StepStatus::Running)
    }

    pub fn mark_completed(&mut self, id: &str, result: impl Into<String>) -> Result<(), PlanError> {
        self.transition(id, StepStatus::Running, StepStatus::Completed)?;
        if let Some(step) = self.steps.get_mut(id) {
            step.result = Some(result.into());
            step.error = None;
        }
        Ok(())
    }

    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Result<(), PlanError> {
        self.transition(id, StepStatus::Running, StepStatus::Failed)?;
        if let Some(step) = self.steps.get_mut(id) {
            step.error = Some(error.into());
        }
        Ok(())
    }

    /// Count one more execution attempt for a running step.
    pub fn record_attempt(&mut self, id: &str) -> Result<u32, PlanError> {
        let step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| PlanError::UnknownStep(id.to_string()))?;
        step.attempts += 1;
        step.updated_at = Utc::now();
        self.updated_at = step.updated_at;
        Ok(step.attempts)
    }

    /// Every step is Completed or Failed.
    pub fn is_finished(&self) -> bool {
        self.steps.values().all(|s| s.status.is_terminal())
    }

    /// Every step is Completed.
    pub fn is_successful(&self) -> bool {
        self.steps.values().all(|s| s.status == StepStatus::Completed)
    }

    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&PlanStep> {
        self.steps.values().filter(|s| s.status == status).collect()
    }

    /// `Some(Stalled)` when nothing can make progress: no step is Ready or
    /// Running, yet not every step has finished.
    pub fn stall(&self) -> Result<Option<PlanError>, PlanError> {
        if self.is_finished()
            || !self.steps_with_status(StepStatus::Running).is_empty()
            || !self.ready_steps()?.is_empty()
        {
            return Ok(None);
        }
        let ids = |status| {
            self.steps_with_status(status)
                .into_iter()
                .map(|s| s.id.clone())
                .collect::<Vec<_>>()
        };
        let mut blocked = ids(StepStatus::Pending);
        blocked.extend(ids(StepStatus::Ready));
        Ok(Some(PlanError::Stalled {
            blocked,
            failed: ids(StepStatus::Failed),
        }))
    }

    /// `(dependency id, result)` for every completed dependency of `id`.
    pub fn dependency_results(&self, id: &str) -> Vec<(String, String)> {
        let Some(step) = self.steps.get(id) else {
            return Vec::new();
        };
        step.dependencies
            .iter()
            .filter_map(|d| self.steps.get(d))
            .filter_map(|d| d.result.as_ref().map(|r| (d.id.clone(), r.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Plan {
        Plan::new(
            "deploy",
            vec![
                PlanStep::new("build", "Build the release"),
                PlanStep::new("test", "Run the test suite").with_dependency("build"),
                PlanStep::new("lint", "Run the linters").with_dependency("build"),
                PlanStep::new("ship", "Ship it").with_dependencies(["test", "lint"]),
            ],
        )
        .unwrap()
    }

    fn ready_ids(plan: &Plan) -> Vec<String> {
        plan.ready_steps().unwrap().iter().map(|s| s.id.clone()).collect()
    }

    fn complete(plan: &mut Plan, id: &str) {
        if plan.step(id).unwrap().status == StepStatus::Pending {
            plan.mark_ready(id).unwrap();
        }
        plan.mark_running(id).unwrap();
        plan.mark_completed(id, format!("{id} done")).unwrap();
    }

    #[test]
    fn rejects_malformed_plans() {
        assert!(matches!(Plan::new("t", vec![]), Err(PlanError::Empty)));
        assert!(matches!(
            Plan::new("t", vec![PlanStep::new("a", "x"), PlanStep::new("a", "y")]),
            Err(PlanError::DuplicateStep(id)) if id == "a"
        ));
        assert!(matches!(
            Plan::new("t", vec![PlanStep::new("a", "x").with_dependency("zzz")]),
            Err(PlanError::UnknownDependency { dependency, .. }) if dependency == "zzz"
        ));
        assert!(matches!(
            Plan::new("t", vec![PlanStep::new("a", "x").with_dependency("a")]),
            Err(PlanError::SelfDependency(_))
        ));
        let cyclic = Plan::new(
            "t",
            vec![
                PlanStep::new("a", "x").with_dependency("b"),
                PlanStep::new("b", "y").with_dependency("a"),
            ],
        );
        assert!(matches!(cyclic, Err(PlanError::Cycle { .. })));
    }

    #[test]
    fn ready_steps_follow_dependencies() {
        let mut plan = chain();
        assert_eq!(ready_ids(&plan), vec!["build"]);

        complete(&mut plan, "build");
        assert_eq!(ready_ids(&plan), vec!["lint", "test"]);

        complete(&mut plan, "test");
        assert_eq!(ready_ids(&plan), vec!["lint"]);

        complete(&mut plan, "lint");
        assert_eq!(ready_ids(&plan), vec!["ship"]);
    }

    #[test]
    fn ready_steps_is_idempotent() {
        let mut plan = chain();
        complete(&mut plan, "build");
        let first = ready_ids(&plan);
        let second = ready_ids(&plan);
        assert_eq!(first, second);

        // Promoting to Ready does not change the answer either.
        plan.mark_ready("test").unwrap();
        assert_eq!(ready_ids(&plan), first);
    }

    #[test]
    fn transitions_are_compare_and_set() {
        let mut plan = chain();

        // Pending cannot jump straight to Running.
        let err = plan.mark_running("build").unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition { actual: StepStatus::Pending, .. }));

        plan.mark_ready("build").unwrap();
        // A second Pending → Ready loses the race.
        assert!(plan.mark_ready("build").is_err());

        plan.mark_running("build").unwrap();
        plan.mark_completed("build", "ok").unwrap();

        // Terminal states stay terminal.
        assert!(plan.mark_failed("build", "late").is_err());
        assert!(plan.transition("build", StepStatus::Completed, StepStatus::Pending).is_err());

        let step = plan.step("build").unwrap();
        assert_eq!(step.result.as_deref(), Some("ok"));
        assert!(step.started_at.is_some());
        assert!(step.finished_at.is_some());
    }

    #[test]
    fn unknown_step_is_reported() {
        let mut plan = chain();
        assert!(matches!(plan.mark_ready("nope"), Err(PlanError::UnknownStep(_))));
    }

    #[test]
    fn failed_dependency_stalls_the_plan() {
        let mut plan = chain();
        complete(&mut plan, "build");
        complete(&mut plan, "lint");
        plan.mark_ready("test").unwrap();
        plan.mark_running("test").unwrap();
        assert!(plan.stall().unwrap().is_none());

        plan.mark_failed("test", "3 tests failed").unwrap();
        match plan.stall().unwrap() {
            Some(PlanError::Stalled { blocked, failed }) => {
                assert_eq!(blocked, vec!["ship"]);
                assert_eq!(failed, vec!["test"]);
            }
            other => panic!("expected stall, got {other:?}"),
        }
    }

    #[test]
    fn finished_plan_does_not_stall() {
        let mut plan = chain();
        for id in ["build", "lint", "test", "ship"] {
            complete(&mut plan, id);
        }
        assert!(plan.is_finished());
        assert!(plan.is_successful());
        assert!(plan.stall().unwrap().is_none());
    }

    #[test]
    fn dependency_results_only_include_completed() {
        let mut plan = chain();
        complete(&mut plan, "build");
        complete(&mut plan, "test");
        let results = plan.dependency_results("ship");
        assert_eq!(results, vec![("test".to_string(), "test done".to_string())]);
    }

    #[test]
    fn json_roundtrip_preserves_state() {
        let mut plan = chain();
        complete(&mut plan, "build");
        plan.record_attempt("build").unwrap();
        plan.mark_ready("test").unwrap();

        let json = serde_json::to_string_pretty(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.step("test").unwrap().status, StepStatus::Ready);
        assert!(json.contains("\"status\": \"completed\""));
    }
}
