//! The four-step dataset workflow.
//!
//! [`WorkflowOrchestrator::execute_workflow`] creates an open dataset,
//! registers replicas for files already on storage, attaches them to the
//! dataset and closes it. Steps run strictly in order. A failing step ends
//! the run. The only compensation is shortening the dataset's lifetime, so
//! replicas and attachments made before the failure stay in place.

pub mod report;

pub use report::{WorkflowResult, WorkflowStage};

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::catalog::{Catalog, Metadata};
use crate::config::WorkflowSettings;
use crate::dataset::{DatasetInfo, DatasetService};
use crate::did::Did;
use crate::error::WorkflowError;
use crate::files::{FileRecord, FileRef, FileService, FileSpec, PfnDetails};

/// One file handed to the workflow, validated or not.
#[derive(Clone, Debug)]
pub enum FileInput {
    Record(FileRecord),
    Spec(FileSpec),
}

impl From<FileRecord> for FileInput {
    fn from(record: FileRecord) -> Self {
        FileInput::Record(record)
    }
}

impl From<FileSpec> for FileInput {
    fn from(spec: FileSpec) -> Self {
        FileInput::Spec(spec)
    }
}

impl FileInput {
    /// Files without a scope take `default_scope`.
    fn into_record(self, default_scope: &str) -> Result<FileRecord, WorkflowError> {
        match self {
            FileInput::Record(record) => Ok(record),
            FileInput::Spec(spec) => FileRecord::from_spec(spec, Some(default_scope)),
        }
    }
}

/// Everything one run needs.
#[derive(Clone, Debug)]
pub struct WorkflowRequest {
    pub dataset: Did,
    pub files: Vec<FileInput>,
    pub rse: String,
    pub metadata: Metadata,
    pub lifetime_days: Option<u32>,
    /// Replicas per registration call; the configured size when `None`.
    pub batch_size: Option<usize>,
}

impl WorkflowRequest {
    pub fn new(dataset: Did, rse: impl Into<String>, files: Vec<FileInput>) -> Self {
        Self {
            dataset,
            files,
            rse: rse.into(),
            metadata: Metadata::new(),
            lifetime_days: None,
            batch_size: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_lifetime_days(mut self, days: u32) -> Self {
        self.lifetime_days = Some(days);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
}

/// Drives the dataset and file services through a workflow run.
pub struct WorkflowOrchestrator {
    catalog: Arc<dyn Catalog>,
    settings: WorkflowSettings,
    datasets: DatasetService,
    files: FileService,
    current: Option<WorkflowResult>,
}

impl WorkflowOrchestrator {
    pub fn new(catalog: Arc<dyn Catalog>, settings: WorkflowSettings) -> Self {
        let datasets = DatasetService::new(catalog.clone());
        let files =
            FileService::new(catalog.clone()).with_attach_batch_size(settings.attach_batch_size);
        Self {
            catalog,
            settings,
            datasets,
            files,
            current: None,
        }
    }

    pub fn datasets(&self) -> &DatasetService {
        &self.datasets
    }

    pub fn files(&self) -> &FileService {
        &self.files
    }

    /// Runs the workflow.
    ///
    /// Step failures never surface as `Err`: they are recorded in the
    /// returned result, which then reports `success == Some(false)`. `Err`
    /// is reserved for requests that are malformed before anything runs.
    pub fn execute_workflow(
        &mut self,
        request: WorkflowRequest,
    ) -> Result<WorkflowResult, WorkflowError> {
        let dataset = Did::dataset(&request.dataset.scope, &request.dataset.name)?;
        if request.rse.trim().is_empty() {
            return Err(WorkflowError::validation("RSE cannot be empty"));
        }
        let batch_size = request.batch_size.unwrap_or(self.settings.batch_size);
        if batch_size == 0 {
            return Err(WorkflowError::validation("Batch size must be positive"));
        }

        let mut result = WorkflowResult::start();
        info!(dataset = %dataset, rse = %request.rse, files = request.files.len(), "starting workflow");

        match self.run_steps(&dataset, request, batch_size, &mut result) {
            Ok(()) => {
                result.mark_complete(true);
                info!(
                    dataset = %dataset,
                    files_registered = result.files_registered(),
                    files_added = result.files_added_to_dataset(),
                    duration_secs = result.duration().as_secs_f64(),
                    "workflow completed"
                );
            }
            Err(e) => {
                let message = format!("Workflow execution failed: {}", e);
                error!("{}", message);
                result.add_error(message);
                result.mark_complete(false);
                if result.dataset_created() {
                    self.cleanup_on_failure(&dataset);
                }
            }
        }

        self.current = Some(result.clone());
        Ok(result)
    }

    fn run_steps(
        &mut self,
        dataset: &Did,
        request: WorkflowRequest,
        batch_size: usize,
        result: &mut WorkflowResult,
    ) -> Result<(), WorkflowError> {
        info!("step 1: creating open dataset");
        let info = self.create_dataset(dataset, request.metadata, request.lifetime_days, result)?;

        info!("step 2: registering files with existing PFNs");
        let records = self.register_files(request.files, &request.rse, batch_size, dataset, result)?;

        info!("step 3: adding files to dataset");
        self.attach_files(&records, &info.did(), &request.rse, result)?;

        info!("step 4: closing dataset");
        self.close_dataset(&info.did(), result)
    }

    fn create_dataset(
        &mut self,
        dataset: &Did,
        metadata: Metadata,
        lifetime_days: Option<u32>,
        result: &mut WorkflowResult,
    ) -> Result<DatasetInfo, WorkflowError> {
        match self.datasets.create_dataset(dataset, metadata, lifetime_days, true) {
            Ok(info) => {
                info!(dataset = %dataset, "created open dataset");
                result.record_dataset(info.clone());
                Ok(info)
            }
            Err(e) => Err(step_failure(
                result,
                format!("Failed to create dataset: {}", e),
                WorkflowError::Dataset,
            )),
        }
    }

    /// Returns the records that were registered.
    fn register_files(
        &mut self,
        inputs: Vec<FileInput>,
        rse: &str,
        batch_size: usize,
        dataset: &Did,
        result: &mut WorkflowResult,
    ) -> Result<Vec<FileRecord>, WorkflowError> {
        let fail = |result: &mut WorkflowResult, reason: String| {
            step_failure(
                result,
                format!("Failed to register files: {}", reason),
                WorkflowError::FileRegistration,
            )
        };

        let records = match inputs
            .into_iter()
            .map(|input| input.into_record(&dataset.scope))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(records) => records,
            Err(e) => return Err(fail(result, e.to_string())),
        };

        let outcome = self.files.register_batch(&records, rse, batch_size);
        let succeeded = outcome.values().filter(|ok| **ok).count();
        result.record_registered(succeeded);
        if succeeded == 0 {
            return Err(fail(
                result,
                "No files were successfully registered".to_string(),
            ));
        }
        info!(succeeded, total = records.len(), rse, "registered files");

        Ok(records
            .into_iter()
            .filter(|record| outcome.get(record.lfn()).copied().unwrap_or(false))
            .collect())
    }

    fn attach_files(
        &mut self,
        records: &[FileRecord],
        dataset: &Did,
        rse: &str,
        result: &mut WorkflowResult,
    ) -> Result<(), WorkflowError> {
        let refs: Vec<FileRef<'_>> = records.iter().map(FileRef::from).collect();
        let reason = match self.files.add_files_to_dataset(&refs, dataset, Some(rse)) {
            Ok(true) => {
                result.record_attached(records.len());
                info!(files = records.len(), "added files to dataset");
                return Ok(());
            }
            Ok(false) => "Failed to add files to dataset".to_string(),
            Err(e) => e.to_string(),
        };
        Err(step_failure(
            result,
            format!("Failed to add files to dataset: {}", reason),
            WorkflowError::FileRegistration,
        ))
    }

    fn close_dataset(&mut self, dataset: &Did, result: &mut WorkflowResult) -> Result<(), WorkflowError> {
        match self.datasets.close_dataset(dataset) {
            Ok(closed) => {
                if closed {
                    info!(dataset = %dataset, "closed dataset");
                } else {
                    // close is never fatal on its own
                    warn!(dataset = %dataset, "dataset close returned false, continuing");
                }
                result.record_closed();
                Ok(())
            }
            Err(e) => Err(step_failure(
                result,
                format!("Failed to close dataset: {}", e),
                WorkflowError::Dataset,
            )),
        }
    }

    fn cleanup_on_failure(&mut self, dataset: &Did) {
        info!(dataset = %dataset, "attempting cleanup after workflow failure");
        match self
            .datasets
            .delete_dataset(dataset, Some(self.settings.cleanup_grace_hours))
        {
            Ok(_) => info!(dataset = %dataset, "cleanup completed"),
            Err(e) => error!(dataset = %dataset, error = %e, "cleanup failed"),
        }
    }

    /// Builds records for a list of PFNs, skipping (and logging) any that
    /// cannot be described. Without `default_scope` every file goes into
    /// `{scope_prefix}.{account}`.
    pub fn create_files_from_pfn_list<S: AsRef<str>>(
        &self,
        pfns: &[S],
        scope_prefix: &str,
        default_scope: Option<&str>,
    ) -> Vec<FileRecord> {
        let scope = match default_scope {
            Some(scope) => scope.to_string(),
            None => format!("{}.{}", scope_prefix, self.catalog.account()),
        };

        let records: Vec<FileRecord> = pfns
            .iter()
            .filter_map(|pfn| {
                let pfn = pfn.as_ref();
                match self.files.create_from_pfn(pfn, &scope, PfnDetails::default()) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        error!(pfn, error = %e, "skipping PFN");
                        None
                    }
                }
            })
            .collect();
        info!(records = records.len(), pfns = pfns.len(), "created file records from PFNs");
        records
    }

    /// Result of the most recent run.
    pub fn current_workflow(&self) -> Option<&WorkflowResult> {
        self.current.as_ref()
    }

    /// Checks after the fact that a dataset exists, is closed and holds
    /// exactly `expected_files` files. Any lookup failure reads as false.
    pub fn verify_workflow_completion(&self, dataset: &Did, expected_files: usize) -> bool {
        let meta = match self.datasets.get_dataset_metadata(dataset) {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                error!(dataset = %dataset, "dataset not found");
                return false;
            }
            Err(e) => {
                error!(dataset = %dataset, error = %e, "verification failed");
                return false;
            }
        };

        let state = meta.get("state").and_then(|state| state.as_str());
        if state != Some("closed") {
            error!(dataset = %dataset, ?state, "dataset is not closed");
            return false;
        }

        match self.datasets.get_dataset_count(dataset) {
            Ok(count) if count == expected_files => {
                info!(dataset = %dataset, "workflow verification passed");
                true
            }
            Ok(count) => {
                error!(dataset = %dataset, count, expected_files, "file count mismatch");
                false
            }
            Err(e) => {
                error!(dataset = %dataset, error = %e, "verification failed");
                false
            }
        }
    }
}

/// Records a step failure and turns it into the error that ends the run.
fn step_failure(
    result: &mut WorkflowResult,
    message: String,
    kind: fn(String) -> WorkflowError,
) -> WorkflowError {
    error!("{}", message);
    result.add_error(message.clone());
    kind(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory::{Faults, InMemoryCatalog};

    fn spec(lfn: &str, size: i64, checksum: &str) -> FileInput {
        FileInput::Spec(FileSpec {
            lfn: lfn.into(),
            pfn: format!("/data/test/{}", lfn),
            size,
            checksum: checksum.into(),
            ..FileSpec::default()
        })
    }

    fn orchestrator() -> (Arc<InMemoryCatalog>, WorkflowOrchestrator) {
        let catalog = Arc::new(InMemoryCatalog::with_account("pilot"));
        let orchestrator = WorkflowOrchestrator::new(catalog.clone(), WorkflowSettings::default());
        (catalog, orchestrator)
    }

    #[test]
    fn malformed_requests_are_rejected_up_front() {
        let (catalog, mut orch) = orchestrator();
        let dataset = Did::new("user.test", "ds");

        let err = orch
            .execute_workflow(WorkflowRequest::new(dataset.clone(), " ", vec![]))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let err = orch
            .execute_workflow(WorkflowRequest::new(dataset, "DISK", vec![]).with_batch_size(0))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        assert!(orch
            .execute_workflow(WorkflowRequest::new(Did::new("bad scope", "ds"), "DISK", vec![]))
            .is_err());
        assert_eq!(catalog.calls().add_dataset, 0);
        assert!(orch.current_workflow().is_none());
    }

    #[test]
    fn spec_files_default_to_dataset_scope() {
        let (catalog, mut orch) = orchestrator();
        let dataset = Did::new("user.test", "ds");
        let result = orch
            .execute_workflow(WorkflowRequest::new(
                dataset.clone(),
                "DISK",
                vec![spec("a.root", 1, "ad:12345678")],
            ))
            .unwrap();

        assert!(result.is_success());
        assert_eq!(
            catalog.contents(&dataset),
            vec![Did::new("user.test", "a.root")]
        );
    }

    #[test]
    fn invalid_file_input_fails_registration_step() {
        let (_catalog, mut orch) = orchestrator();
        let result = orch
            .execute_workflow(WorkflowRequest::new(
                Did::new("user.test", "ds"),
                "DISK",
                vec![spec("a.root", 1, "invalid:checksum")],
            ))
            .unwrap();

        assert_eq!(result.success(), Some(false));
        assert_eq!(result.failed_stage(), Some(WorkflowStage::Created));
        assert!(result.errors()[0].starts_with("Failed to register files:"));
        assert!(result.errors()[1].starts_with("Workflow execution failed:"));
    }

    #[test]
    fn partial_registration_attaches_only_successes() {
        let (catalog, mut orch) = orchestrator();
        catalog.set_faults(Faults {
            fail_replica_batches: true,
            rejected_lfns: ["b.root".to_string()].into_iter().collect(),
            ..Faults::default()
        });
        let dataset = Did::new("user.test", "ds");
        let result = orch
            .execute_workflow(WorkflowRequest::new(
                dataset.clone(),
                "DISK",
                vec![spec("a.root", 1, "ad:12345678"), spec("b.root", 2, "ad:87654321")],
            ))
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.files_registered(), 1);
        assert_eq!(result.files_added_to_dataset(), 1);
        assert_eq!(catalog.contents(&dataset).len(), 1);
        assert!(orch.verify_workflow_completion(&dataset, 1));
    }

    #[test]
    fn attach_failure_triggers_cleanup() {
        let (catalog, mut orch) = orchestrator();
        catalog.set_faults(Faults {
            fail_attach: true,
            ..Faults::default()
        });
        let dataset = Did::new("user.test", "ds");
        let result = orch
            .execute_workflow(WorkflowRequest::new(
                dataset.clone(),
                "DISK",
                vec![spec("a.root", 1, "ad:12345678")],
            ))
            .unwrap();

        assert_eq!(result.success(), Some(false));
        assert_eq!(result.files_registered(), 1);
        assert!(!result.dataset_closed());
        assert_eq!(result.failed_stage(), Some(WorkflowStage::FilesRegistered));
        let meta = catalog.get_metadata(&dataset).unwrap().done().unwrap();
        assert_eq!(meta["lifetime"], serde_json::json!(3600));
    }

    #[test]
    fn failed_cleanup_stays_inside_result() {
        let (catalog, mut orch) = orchestrator();
        catalog.set_faults(Faults {
            fail_set_metadata: true,
            fail_attach: true,
            ..Faults::default()
        });
        let dataset = Did::new("user.test", "ds");
        let result = orch
            .execute_workflow(
                WorkflowRequest::new(
                    dataset.clone(),
                    "DISK",
                    vec![spec("a.root", 1, "ad:00000001")],
                )
                .with_lifetime_days(7),
            )
            .unwrap();

        assert_eq!(result.success(), Some(false));
        assert!(result.dataset_created());
        assert_eq!(result.errors().len(), 2, "errors: {:?}", result.errors());
        assert!(result.errors()[0].starts_with("Failed to add files to dataset"));
        assert!(result.errors()[1].starts_with("Workflow execution failed:"));
        // lifetime at creation, then the cleanup attempt
        assert_eq!(catalog.calls().set_metadata, 2);
        assert_eq!(orch.datasets().created_datasets(), vec![dataset]);
    }

    #[test]
    fn close_failure_is_recorded() {
        let (catalog, mut orch) = orchestrator();
        let dataset = Did::new("user.test", "ds");
        catalog.set_faults(Faults {
            fail_status: true,
            ..Faults::default()
        });
        let result = orch
            .execute_workflow(WorkflowRequest::new(
                dataset,
                "DISK",
                vec![spec("a.root", 1, "ad:12345678")],
            ))
            .unwrap();

        assert_eq!(result.success(), Some(false));
        assert_eq!(result.files_added_to_dataset(), 1);
        assert!(result.errors()[0].starts_with("Failed to close dataset:"));
    }

    #[test]
    fn pfn_list_uses_account_scope() {
        let (_catalog, orch) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.root");
        std::fs::write(&path, b"payload").unwrap();
        let pfns = vec![
            path.to_str().unwrap().to_string(),
            "root://remote.example.org//no/size.root".to_string(),
        ];

        let records = orch.create_files_from_pfn_list(&pfns, "user", None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].scope(), "user.pilot");
        assert_eq!(records[0].lfn(), "data.root");

        let records = orch.create_files_from_pfn_list(&pfns[..1], "user", Some("group.phys"));
        assert_eq!(records[0].scope(), "group.phys");
    }

    #[test]
    fn verification_rejects_open_or_short_datasets() {
        let (catalog, orch) = orchestrator();
        let dataset = Did::new("user.test", "ds");
        assert!(!orch.verify_workflow_completion(&dataset, 0));

        catalog.add_dataset(&dataset, &Metadata::new()).unwrap();
        assert!(!orch.verify_workflow_completion(&dataset, 0));

        catalog.set_status(&dataset, false).unwrap();
        assert!(orch.verify_workflow_completion(&dataset, 0));
        assert!(!orch.verify_workflow_completion(&dataset, 3));
    }

    #[test]
    fn verification_fails_when_metadata_lookup_fails() {
        let (catalog, mut orch) = orchestrator();
        let dataset = Did::new("user.test", "ds");
        let result = orch
            .execute_workflow(WorkflowRequest::new(
                dataset.clone(),
                "DISK",
                vec![spec("a.root", 1, "ad:00000001")],
            ))
            .unwrap();
        assert_eq!(result.success(), Some(true));
        assert!(orch.verify_workflow_completion(&dataset, 1));

        catalog.set_faults(Faults {
            fail_get_metadata: true,
            ..Faults::default()
        });
        assert!(!orch.verify_workflow_completion(&dataset, 1));
    }
}
