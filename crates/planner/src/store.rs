//! Durable plan state.
//!
//! The runner saves the whole plan after every step transition, so a crashed
//! run can be resumed by loading the plan and recomputing the ready steps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use agentloom_config::PlannerConfig;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PlanError;
use crate::model::Plan;

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn save(&self, plan: &Plan) -> Result<(), PlanError>;

    async fn load(&self, plan_id: &str) -> Result<Option<Plan>, PlanError>;

    /// Ids of every stored plan.
    async fn list(&self) -> Result<Vec<String>, PlanError>;
}

/// One pretty-printed JSON file per plan, replaced atomically on save.
pub struct FilePlanStore {
    dir: PathBuf,
}

impl FilePlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &PlannerConfig) -> Self {
        Self::new(&config.state_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, plan_id: &str) -> Result<PathBuf, PlanError> {
        let valid = !plan_id.is_empty()
            && plan_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PlanError::InvalidId(plan_id.to_string()));
        }
        Ok(self.dir.join(format!("{plan_id}.json")))
    }
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn save(&self, plan: &Plan) -> Result<(), PlanError> {
        let path = self.path_for(&plan.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec_pretty(plan)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(plan_id = %plan.id, path = %path.display(), "Plan saved");
        Ok(())
    }

    async fn load(&self, plan_id: &str) -> Result<Option<Plan>, PlanError> {
        let path = self.path_for(plan_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, PlanError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Keeps plans in memory and counts saves.
#[derive(Default)]
pub struct InMemoryPlanStore {
    plans: Mutex<HashMap<String, Plan>>,
    history: Mutex<Vec<Plan>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every saved snapshot, oldest first.
    pub async fn history(&self) -> Vec<Plan> {
        self.history.lock().await.clone()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn save(&self, plan: &Plan) -> Result<(), PlanError> {
        self.plans.lock().await.insert(plan.id.clone(), plan.clone());
        self.history.lock().await.push(plan.clone());
        Ok(())
    }

    async fn load(&self, plan_id: &str) -> Result<Option<Plan>, PlanError> {
        Ok(self.plans.lock().await.get(plan_id).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, PlanError> {
        let mut ids: Vec<String> = self.plans.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlanStep, StepStatus};

    fn plan() -> Plan {
        Plan::new(
            "backup",
            vec![
                PlanStep::new("dump", "Dump the database"),
                PlanStep::new("upload", "Upload the dump").with_dependency("dump"),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path().join("plans"));
        let mut plan = plan();
        plan.mark_ready("dump").unwrap();

        store.save(&plan).await.unwrap();
        let loaded = store.load(&plan.id).await.unwrap().unwrap();
        assert_eq!(loaded, plan);
        assert_eq!(loaded.step("dump").unwrap().status, StepStatus::Ready);
        assert_eq!(store.list().await.unwrap(), vec![plan.id.clone()]);
    }

    #[tokio::test]
    async fn save_replaces_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path());
        let mut plan = plan();
        store.save(&plan).await.unwrap();
        plan.mark_ready("dump").unwrap();
        store.save(&plan).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", plan.id)]);
        let loaded = store.load(&plan.id).await.unwrap().unwrap();
        assert_eq!(loaded.step("dump").unwrap().status, StepStatus::Ready);
    }

    #[tokio::test]
    async fn missing_plan_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path().join("never-created"));
        assert!(store.load("abc").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_traversal_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path());
        let err = store.load("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, PlanError::InvalidId(_)));
    }

    #[tokio::test]
    async fn memory_store_keeps_history() {
        let store = InMemoryPlanStore::new();
        let mut plan = plan();
        store.save(&plan).await.unwrap();
        plan.mark_ready("dump").unwrap();
        store.save(&plan).await.unwrap();

        assert_eq!(store.history().await.len(), 2);
        let loaded = store.load(&plan.id).await.unwrap().unwrap();
        assert_eq!(loaded.step("dump").unwrap().status, StepStatus::Ready);
    }
}
