//! Workflow result accumulator and terminal formatting.
//!
//! A [`WorkflowResult`] is filled in by the orchestrator while a run is in
//! progress, finalized exactly once, and read-only for everyone else. It
//! renders as text (Display) or serializes as JSON.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dataset::DatasetInfo;

/// How far a workflow run got.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// Nothing has happened yet.
    Pending,
    /// The dataset exists and is open.
    Created,
    /// At least one replica is registered.
    FilesRegistered,
    /// The registered files are in the dataset.
    FilesAttached,
    /// The dataset is closed.
    Closed,
    Done,
    Failed,
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStage::Pending => "pending",
            WorkflowStage::Created => "created",
            WorkflowStage::FilesRegistered => "files registered",
            WorkflowStage::FilesAttached => "files attached",
            WorkflowStage::Closed => "closed",
            WorkflowStage::Done => "done",
            WorkflowStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The outcome of one workflow run.
#[derive(Clone, Debug, Serialize)]
pub struct WorkflowResult {
    success: Option<bool>,
    dataset_created: bool,
    dataset: Option<DatasetInfo>,
    files_registered: usize,
    files_added_to_dataset: usize,
    dataset_closed: bool,
    errors: Vec<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    stage: WorkflowStage,
    /// Last stage reached before the run failed.
    failed_stage: Option<WorkflowStage>,
}

impl WorkflowResult {
    pub(crate) fn start() -> Self {
        Self {
            success: None,
            dataset_created: false,
            dataset: None,
            files_registered: 0,
            files_added_to_dataset: 0,
            dataset_closed: false,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            stage: WorkflowStage::Pending,
            failed_stage: None,
        }
    }

    pub(crate) fn record_dataset(&mut self, info: DatasetInfo) {
        self.dataset_created = true;
        self.dataset = Some(info);
        self.stage = WorkflowStage::Created;
    }

    pub(crate) fn record_registered(&mut self, count: usize) {
        self.files_registered = count;
        if count > 0 {
            self.stage = WorkflowStage::FilesRegistered;
        }
    }

    pub(crate) fn record_attached(&mut self, count: usize) {
        self.files_added_to_dataset = count;
        self.stage = WorkflowStage::FilesAttached;
    }

    pub(crate) fn record_closed(&mut self) {
        self.dataset_closed = true;
        self.stage = WorkflowStage::Closed;
    }

    pub(crate) fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Finalizes the run. Later calls are ignored.
    pub(crate) fn mark_complete(&mut self, success: bool) {
        if self.finished_at.is_some() {
            return;
        }
        self.success = Some(success);
        self.finished_at = Some(Utc::now());
        if success {
            self.stage = WorkflowStage::Done;
        } else {
            self.failed_stage = Some(self.stage);
            self.stage = WorkflowStage::Failed;
        }
    }

    /// `None` until the run is finalized.
    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn is_success(&self) -> bool {
        self.success == Some(true)
    }

    pub fn dataset_created(&self) -> bool {
        self.dataset_created
    }

    pub fn dataset(&self) -> Option<&DatasetInfo> {
        self.dataset.as_ref()
    }

    pub fn files_registered(&self) -> usize {
        self.files_registered
    }

    pub fn files_added_to_dataset(&self) -> usize {
        self.files_added_to_dataset
    }

    pub fn dataset_closed(&self) -> bool {
        self.dataset_closed
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn stage(&self) -> WorkflowStage {
        self.stage
    }

    pub fn failed_stage(&self) -> Option<WorkflowStage> {
        self.failed_stage
    }

    /// Wall time of the run; zero until finalized.
    pub fn duration(&self) -> Duration {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for WorkflowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.success {
            Some(true) => "SUCCESS",
            Some(false) => "FAILED",
            None => "RUNNING",
        };
        writeln!(
            f,
            "Workflow {} in {:.2}s",
            status,
            self.duration().as_secs_f64()
        )?;

        match &self.dataset {
            Some(info) => writeln!(
                f,
                "  dataset:                {}:{} (vuid {})",
                info.scope, info.name, info.vuid
            )?,
            None => writeln!(f, "  dataset:                <not created>")?,
        }
        writeln!(f, "  files registered:       {}", self.files_registered)?;
        writeln!(f, "  files added to dataset: {}", self.files_added_to_dataset)?;
        writeln!(
            f,
            "  dataset closed:         {}",
            if self.dataset_closed { "yes" } else { "no" }
        )?;
        if let Some(stage) = self.failed_stage {
            writeln!(f, "  failed after stage:     {}", stage)?;
        }

        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "Errors:")?;
            for error in &self.errors {
                writeln!(f, "  - {}", error)?;
            }
        }

        Ok(())
    }
}
