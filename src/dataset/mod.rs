//! Dataset lifecycle: create, open, attach, close, inspect and expire.
//!
//! Races with other writers are expected. Creating a dataset that already
//! exists, closing one that is gone and deleting one that was never there
//! all succeed.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, CatalogErrorKind, DidType, FileEntry, Metadata, Outcome};
use crate::did::ids::{format_guid, generate_vuid};
use crate::did::Did;
use crate::error::WorkflowError;

const SECONDS_PER_DAY: u64 = 86_400;
const SECONDS_PER_HOUR: u64 = 3_600;

/// Lifetime used to expire a dataset right away.
const IMMEDIATE_LIFETIME: f64 = 0.0001;

/// Identifiers of a dataset returned by [`DatasetService::create_dataset`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub scope: String,
    pub name: String,
    pub duid: String,
    pub vuid: String,
    pub version: u32,
}

impl DatasetInfo {
    fn new(did: &Did) -> Self {
        let vuid = generate_vuid(&did.scope, &did.name);
        Self {
            scope: did.scope.clone(),
            name: did.name.clone(),
            duid: vuid.clone(),
            vuid,
            version: 1,
        }
    }

    pub fn did(&self) -> Did {
        Did::new(self.scope.clone(), self.name.clone())
    }
}

/// Result of [`DatasetService::attach_files`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttachReport {
    pub dataset: String,
    pub files_attached: usize,
    pub files: Vec<Did>,
    pub rse: Option<String>,
}

/// One file of a dataset listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileAttributes {
    pub lfn: String,
    pub scope: String,
    pub fsize: u64,
    pub filesize: u64,
    pub chksum: String,
    pub checksum: String,
    pub events: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lumiblocknr: Option<String>,
}

impl FileAttributes {
    fn from_entry(entry: FileEntry, long: bool) -> Self {
        let checksum = format!("ad:{}", entry.adler32.unwrap_or_default());
        Self {
            lfn: entry.name,
            scope: entry.scope,
            fsize: entry.bytes,
            filesize: entry.bytes,
            chksum: checksum.clone(),
            checksum,
            events: entry.events.as_ref().map(render).unwrap_or_default(),
            guid: entry
                .guid
                .filter(|guid| !guid.is_empty())
                .map(|guid| format_guid(&guid)),
            lumiblocknr: entry
                .lumiblocknr
                .as_ref()
                .filter(|_| long)
                .map(render),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Builds dataset metadata: `hidden=false` and `purge_replicas=0`, then the
/// caller's keys on top. Falsy `task_id`/`campaign` values (null, `false`,
/// zero, or an empty string, array or object) are dropped and `task_id` is
/// stored as a string.
pub fn dataset_metadata(caller: Metadata) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("hidden".into(), Value::Bool(false));
    meta.insert("purge_replicas".into(), Value::from(0));

    for (key, value) in caller {
        match key.as_str() {
            "task_id" | "campaign" if is_blank(&value) => {}
            "task_id" => {
                meta.insert(key, Value::String(render(&value)));
            }
            _ => {
                meta.insert(key, value);
            }
        }
    }
    meta
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

/// Dataset operations against one catalog.
pub struct DatasetService {
    catalog: Arc<dyn Catalog>,
    created: BTreeSet<Did>,
}

impl DatasetService {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            created: BTreeSet::new(),
        }
    }

    /// Creates a dataset, or adopts it when it already exists.
    ///
    /// Setting the lifetime and opening the dataset are best effort: a
    /// failure there is logged and the call still succeeds.
    pub fn create_dataset(
        &mut self,
        did: &Did,
        metadata: Metadata,
        lifetime_days: Option<u32>,
        open: bool,
    ) -> Result<DatasetInfo, WorkflowError> {
        info!(dataset = %did, "creating dataset");
        let meta = dataset_metadata(metadata);

        let fail = |reason: String| {
            let message = format!("Failed to create dataset {}: {}", did.name, reason);
            error!("{}", message);
            WorkflowError::dataset(message)
        };
        match self.catalog.add_dataset(did, &meta) {
            Ok(Outcome::Done(())) => info!(dataset = %did, "created dataset"),
            Ok(Outcome::AlreadyExists(_)) => warn!(dataset = %did, "dataset already exists"),
            Ok(Outcome::NotFound(message)) => return Err(fail(message)),
            Err(e) => return Err(fail(e.to_string())),
        }

        if let Some(days) = lifetime_days {
            let seconds = u64::from(days) * SECONDS_PER_DAY;
            match self.catalog.set_metadata(did, "lifetime", &Value::from(seconds)) {
                Ok(Outcome::Done(())) => info!(dataset = %did, days, "set dataset lifetime"),
                Ok(Outcome::AlreadyExists(message) | Outcome::NotFound(message)) => {
                    warn!(dataset = %did, %message, "failed to set lifetime")
                }
                Err(e) => warn!(dataset = %did, error = %e, "failed to set lifetime"),
            }
        }

        if open {
            self.ensure_open(did);
        }

        self.created.insert(did.clone());
        Ok(DatasetInfo::new(did))
    }

    fn ensure_open(&self, did: &Did) {
        let is_open = match self.catalog.get_metadata(did) {
            Ok(Outcome::Done(meta)) => meta.get("is_open").and_then(Value::as_bool) == Some(true),
            Ok(_) => false,
            Err(e) => {
                warn!(dataset = %did, error = %e, "failed to read dataset status");
                return;
            }
        };
        if is_open {
            debug!(dataset = %did, "dataset already open");
            return;
        }

        match self.catalog.set_status(did, true) {
            Ok(Outcome::Done(())) => info!(dataset = %did, "set dataset to open"),
            Ok(Outcome::AlreadyExists(message) | Outcome::NotFound(message)) => {
                warn!(dataset = %did, %message, "failed to set dataset to open")
            }
            Err(e) => warn!(dataset = %did, error = %e, "failed to set dataset to open"),
        }
    }

    /// Closes a dataset. A dataset that is gone or cannot be closed still
    /// reports `true`.
    pub fn close_dataset(&self, did: &Did) -> Result<bool, WorkflowError> {
        info!(dataset = %did, "closing dataset");
        match self.catalog.set_status(did, false) {
            Ok(Outcome::Done(())) | Ok(Outcome::AlreadyExists(_)) => {
                info!(dataset = %did, "closed dataset");
                Ok(true)
            }
            Ok(Outcome::NotFound(message)) => {
                warn!(dataset = %did, %message, "could not close dataset");
                Ok(true)
            }
            Err(e) if e.kind == CatalogErrorKind::Unsupported => {
                warn!(dataset = %did, error = %e, "could not close dataset");
                Ok(true)
            }
            Err(e) => {
                let message = format!("Failed to close dataset {}: {}", did.name, e);
                error!("{}", message);
                Err(WorkflowError::dataset(message))
            }
        }
    }

    /// Attaches existing files to a dataset in one call.
    ///
    /// With an `rse`, each file is first looked up there; a file missing
    /// from the RSE is only logged.
    pub fn attach_files(
        &self,
        did: &Did,
        files: &[Did],
        rse: Option<&str>,
    ) -> Result<AttachReport, WorkflowError> {
        info!(dataset = %did, files = files.len(), "attaching files");
        let fail = |reason: String| {
            let message = format!("Failed to attach files to dataset {}: {}", did, reason);
            error!("{}", message);
            WorkflowError::dataset(message)
        };

        match self.catalog.get_did(did) {
            Ok(Outcome::Done(_)) => {}
            Ok(_) => return Err(WorkflowError::dataset(format!("Dataset not found: {}", did))),
            Err(e) => return Err(fail(e.to_string())),
        }

        if let Some(rse) = rse {
            for file in files {
                self.check_on_rse(file, rse);
            }
        }

        match self.catalog.attach_dids(did, files) {
            Ok(Outcome::Done(())) => {}
            Ok(Outcome::AlreadyExists(message) | Outcome::NotFound(message)) => {
                return Err(fail(message))
            }
            Err(e) => return Err(fail(e.to_string())),
        }

        info!(dataset = %did, files = files.len(), "attached files");
        Ok(AttachReport {
            dataset: did.to_string(),
            files_attached: files.len(),
            files: files.to_vec(),
            rse: rse.map(str::to_string),
        })
    }

    fn check_on_rse(&self, file: &Did, rse: &str) {
        match self
            .catalog
            .list_replicas(std::slice::from_ref(file), Some(rse))
        {
            Ok(Outcome::Done(replicas))
                if replicas.iter().any(|replica| replica.rses.contains_key(rse)) => {}
            Ok(_) => warn!(file = %file, rse, "file not found on RSE"),
            Err(e) => warn!(file = %file, rse, error = %e, "could not verify file on RSE"),
        }
    }

    /// Catalog metadata plus a `state` of `open` or `closed`. `None` when the
    /// dataset does not exist.
    pub fn get_dataset_metadata(&self, did: &Did) -> Result<Option<Metadata>, WorkflowError> {
        debug!(dataset = %did, "getting dataset metadata");
        match self.catalog.get_metadata(did) {
            Ok(Outcome::Done(mut meta)) => {
                let open = meta.get("is_open").and_then(Value::as_bool) == Some(true);
                let container = meta.get("did_type").and_then(Value::as_str)
                    == Some(did_type_name(DidType::Container));
                let state = if open && !container { "open" } else { "closed" };
                meta.insert("state".into(), Value::from(state));
                Ok(Some(meta))
            }
            Ok(_) => {
                warn!(dataset = %did, "dataset not found");
                Ok(None)
            }
            Err(e) => {
                let message = format!("Failed to get metadata for dataset {}: {}", did.name, e);
                error!("{}", message);
                Err(WorkflowError::dataset(message))
            }
        }
    }

    /// Files in a dataset keyed by LFN.
    pub fn list_dataset_files(
        &self,
        did: &Did,
        long: bool,
    ) -> Result<IndexMap<String, FileAttributes>, WorkflowError> {
        debug!(dataset = %did, long, "listing dataset files");
        let entries = match self.catalog.list_files(did, long) {
            Ok(Outcome::Done(entries)) => entries,
            Ok(Outcome::AlreadyExists(message) | Outcome::NotFound(message)) => {
                return Err(list_error(did, message))
            }
            Err(e) => return Err(list_error(did, e.to_string())),
        };

        let files: IndexMap<_, _> = entries
            .into_iter()
            .map(|entry| {
                let attrs = FileAttributes::from_entry(entry, long);
                (attrs.lfn.clone(), attrs)
            })
            .collect();
        info!(dataset = %did, files = files.len(), "listed dataset files");
        Ok(files)
    }

    /// Number of files in a dataset; zero when it does not exist.
    pub fn get_dataset_count(&self, did: &Did) -> Result<usize, WorkflowError> {
        match self.catalog.list_files(did, false) {
            Ok(Outcome::Done(entries)) => Ok(entries.len()),
            Ok(_) => {
                warn!(dataset = %did, "dataset not found");
                Ok(0)
            }
            Err(e) => {
                let message = format!("Failed to count files in dataset {}: {}", did.name, e);
                error!("{}", message);
                Err(WorkflowError::dataset(message))
            }
        }
    }

    /// Marks a dataset for deletion by shortening its lifetime to the grace
    /// period, or to almost nothing without one.
    pub fn delete_dataset(
        &mut self,
        did: &Did,
        grace_period_hours: Option<u32>,
    ) -> Result<bool, WorkflowError> {
        info!(dataset = %did, ?grace_period_hours, "deleting dataset");
        let lifetime = match grace_period_hours {
            Some(hours) => Value::from(u64::from(hours) * SECONDS_PER_HOUR),
            None => Value::from(IMMEDIATE_LIFETIME),
        };

        match self.catalog.set_metadata(did, "lifetime", &lifetime) {
            Ok(Outcome::Done(())) | Ok(Outcome::AlreadyExists(_)) => {
                info!(dataset = %did, "set deletion lifetime");
                self.created.remove(did);
                Ok(true)
            }
            Ok(Outcome::NotFound(_)) => {
                warn!(dataset = %did, "dataset not found for deletion");
                Ok(true)
            }
            Err(e) => {
                let message = format!("Failed to delete dataset {}: {}", did.name, e);
                error!("{}", message);
                Err(WorkflowError::dataset(message))
            }
        }
    }

    /// Datasets created through this service and not deleted since.
    pub fn created_datasets(&self) -> Vec<Did> {
        self.created.iter().cloned().collect()
    }

    /// Marks every tracked dataset for deletion. Returns how many were
    /// marked; failures are logged and skipped.
    pub fn cleanup_created_datasets(&mut self, grace_period_hours: u32) -> usize {
        let mut deleted = 0;
        for did in self.created_datasets() {
            match self.delete_dataset(&did, Some(grace_period_hours)) {
                Ok(_) => deleted += 1,
                Err(e) => error!(dataset = %did, error = %e, "failed to clean up dataset"),
            }
        }
        deleted
    }
}

fn did_type_name(did_type: DidType) -> &'static str {
    match did_type {
        DidType::File => "FILE",
        DidType::Dataset => "DATASET",
        DidType::Container => "CONTAINER",
    }
}

fn list_error(did: &Did, reason: String) -> WorkflowError {
    let message = format!("Failed to list files in dataset {}: {}", did.name, reason);
    error!("{}", message);
    WorkflowError::dataset(message)
}
