//! Planning for multi-step tasks.
//!
//! A task is decomposed by the model into a [`Plan`]: a DAG of [`PlanStep`]s
//! keyed by id. The planner validates structure (unique ids, known
//! dependencies, no cycles), reports which steps are ready, and executes
//! them concurrently through a [`StepExecutor`], persisting the plan after
//! every transition so an interrupted run can resume.
//!
//! ```text
//! Pending ──▶ Ready ──▶ Running ──▶ Completed
//!                          └──────▶ Failed
//! ```

pub mod decompose;
pub mod error;
pub mod executor;
pub mod graph;
pub mod model;
pub mod store;

pub use decompose::{Planner, parse_steps};
pub use error::PlanError;
pub use executor::{AgentStepExecutor, PlanRunner, StepContext, StepError, StepExecutor};
pub use graph::{detect_cycle, find_cycle, topological_order};
pub use model::{Plan, PlanStep, StepStatus};
pub use store::{FilePlanStore, InMemoryPlanStore, PlanStore};
