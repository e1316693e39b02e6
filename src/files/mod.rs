//! File replica registration and dataset attachment.
//!
//! [`FileService`] turns validated [`FileRecord`]s into catalog replicas and
//! associates them with datasets. Bulk operations go out in batches; a
//! failed batch is retried file by file so one bad record costs only itself.

pub mod record;

pub use record::{adler32_file, parse_pfn, Checksum, FileRecord, FileSpec, PfnParts};

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, FilePayload, Metadata, Outcome};
use crate::did::{resolve_scope, Did};
use crate::error::WorkflowError;
use crate::validation::{validate_lfn, validate_scope};

/// Files per dataset attachment call unless configured otherwise.
pub const DEFAULT_ATTACH_BATCH_SIZE: usize = 1000;

/// A file to attach: a full record, or just a combined name whose scope is
/// resolved the same way dataset names are.
#[derive(Clone, Copy, Debug)]
pub enum FileRef<'a> {
    Record(&'a FileRecord),
    Name(&'a str),
}

impl<'a> From<&'a FileRecord> for FileRef<'a> {
    fn from(record: &'a FileRecord) -> Self {
        FileRef::Record(record)
    }
}

impl FileRef<'_> {
    fn payload(&self) -> Result<FilePayload, WorkflowError> {
        match self {
            FileRef::Record(record) => record.attach_payload(),
            FileRef::Name(name) => {
                let (scope, name) = resolve_scope(name, false)?;
                validate_scope(&scope)?;
                validate_lfn(&name)?;
                Ok(FilePayload::bare(&Did::new(scope, name)))
            }
        }
    }
}

/// What is known about a file beyond its PFN. Missing size and checksum
/// are derived from the file itself when it is local.
#[derive(Clone, Debug, Default)]
pub struct PfnDetails {
    pub lfn: Option<String>,
    pub size: Option<u64>,
    pub checksum: Option<String>,
    pub metadata: Metadata,
}

/// Registers replicas and attaches files to datasets.
pub struct FileService {
    catalog: Arc<dyn Catalog>,
    attach_batch_size: usize,
    registered: BTreeSet<String>,
}

impl FileService {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            attach_batch_size: DEFAULT_ATTACH_BATCH_SIZE,
            registered: BTreeSet::new(),
        }
    }

    /// Sets how many files go into one attachment call. Zero is read as one.
    pub fn with_attach_batch_size(mut self, size: usize) -> Self {
        self.attach_batch_size = size.max(1);
        self
    }

    /// Registers one replica at `rse`. A replica that already exists counts
    /// as registered.
    pub fn register_replica(&mut self, record: &FileRecord, rse: &str) -> Result<(), WorkflowError> {
        info!(lfn = record.lfn(), rse, "registering file replica");
        let fail = |reason: String| {
            let message = format!("Failed to register file replica {}: {}", record.lfn(), reason);
            error!("{}", message);
            WorkflowError::registration(message)
        };

        let payload = record.replica_payload().map_err(|e| fail(e.to_string()))?;
        match self.catalog.add_replicas(rse, &[payload]) {
            Ok(Outcome::Done(())) => info!(lfn = record.lfn(), "registered replica"),
            Ok(Outcome::AlreadyExists(_)) => {
                warn!(lfn = record.lfn(), "file replica already exists")
            }
            Ok(Outcome::NotFound(message)) => return Err(fail(message)),
            Err(e) => return Err(fail(e.to_string())),
        }

        self.registered.insert(record.did().to_string());
        Ok(())
    }

    /// Registers replicas in batches of `batch_size`, falling back to one
    /// call per record when a batch call does not go through.
    ///
    /// Returns success per LFN, in input order. Records sharing an LFN share
    /// an entry.
    pub fn register_batch(
        &mut self,
        records: &[FileRecord],
        rse: &str,
        batch_size: usize,
    ) -> IndexMap<String, bool> {
        let batch_size = batch_size.max(1);
        let mut results: IndexMap<String, bool> = IndexMap::with_capacity(records.len());
        info!(files = records.len(), rse, batch_size, "registering files");

        for (index, batch) in records.chunks(batch_size).enumerate() {
            debug!(batch = index + 1, files = batch.len(), "processing batch");

            let mut payloads = Vec::with_capacity(batch.len());
            for record in batch {
                match record.replica_payload() {
                    Ok(payload) => payloads.push(payload),
                    Err(e) => {
                        error!(lfn = record.lfn(), error = %e, "failed to prepare file");
                        results.insert(record.lfn().to_string(), false);
                    }
                }
            }
            if payloads.is_empty() {
                continue;
            }

            let failure = match self.catalog.add_replicas(rse, &payloads) {
                Ok(Outcome::Done(())) => None,
                Ok(Outcome::AlreadyExists(message) | Outcome::NotFound(message)) => Some(message),
                Err(e) => Some(e.to_string()),
            };

            match failure {
                None => {
                    for record in batch {
                        if !results.contains_key(record.lfn()) {
                            results.insert(record.lfn().to_string(), true);
                            self.registered.insert(record.did().to_string());
                        }
                    }
                    info!(files = payloads.len(), "registered batch");
                }
                Some(reason) => {
                    error!(%reason, "batch registration failed, retrying files individually");
                    for record in batch {
                        if !results.contains_key(record.lfn()) {
                            let ok = self.register_replica(record, rse).is_ok();
                            results.insert(record.lfn().to_string(), ok);
                        }
                    }
                }
            }
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        info!(succeeded, total = records.len(), "registration completed");
        results
    }

    /// Attaches files to `dataset`, optionally registering them at `rse`.
    ///
    /// A batch refused because some file is already attached is retried one
    /// file at a time, and files already in the dataset are skipped.
    pub fn add_files_to_dataset(
        &self,
        files: &[FileRef<'_>],
        dataset: &Did,
        rse: Option<&str>,
    ) -> Result<bool, WorkflowError> {
        info!(files = files.len(), dataset = %dataset, "adding files to dataset");
        let fail = |reason: String| {
            let message = format!("Failed to add files to dataset {}: {}", dataset, reason);
            error!("{}", message);
            WorkflowError::registration(message)
        };

        let payloads = files
            .iter()
            .map(FileRef::payload)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| fail(e.to_string()))?;

        for batch in payloads.chunks(self.attach_batch_size) {
            match self.catalog.add_files_to_dataset(dataset, batch, rse) {
                Ok(Outcome::Done(())) => debug!(files = batch.len(), "added batch to dataset"),
                Ok(Outcome::AlreadyExists(_)) => {
                    for payload in batch {
                        match self
                            .catalog
                            .add_files_to_dataset(dataset, std::slice::from_ref(payload), rse)
                        {
                            Ok(Outcome::Done(())) => {}
                            Ok(Outcome::AlreadyExists(_)) => {
                                debug!(name = %payload.name, "file already in dataset")
                            }
                            Ok(Outcome::NotFound(message)) => return Err(fail(message)),
                            Err(e) => return Err(fail(e.to_string())),
                        }
                    }
                }
                Ok(Outcome::NotFound(message)) => return Err(fail(message)),
                Err(e) => return Err(fail(e.to_string())),
            }
        }

        info!(dataset = %dataset, "added files to dataset");
        Ok(true)
    }

    /// Builds a record for a file known by its PFN.
    ///
    /// The LFN defaults to the PFN's filename. Size and checksum are read
    /// from local files when not given; for remote files they are required.
    pub fn create_from_pfn(
        &self,
        pfn: &str,
        scope: &str,
        details: PfnDetails,
    ) -> Result<FileRecord, WorkflowError> {
        build_from_pfn(pfn, scope, details).map_err(|reason| {
            let message = format!("Failed to create file record from PFN {}: {}", pfn, reason);
            error!("{}", message);
            WorkflowError::registration(message)
        })
    }

    /// True when the catalog lists a replica of the file at `rse`. Lookup
    /// failures read as false.
    pub fn verify_replica(&self, record: &FileRecord, rse: &str) -> bool {
        match self.catalog.list_replicas(&[record.did()], None) {
            Ok(Outcome::Done(replicas)) => replicas
                .first()
                .map(|replica| replica.rses.contains_key(rse))
                .unwrap_or(false),
            Ok(_) => false,
            Err(e) => {
                error!(lfn = record.lfn(), error = %e, "failed to verify file registration");
                false
            }
        }
    }

    /// `scope:name` of every file this service registered.
    pub fn registered_files(&self) -> Vec<String> {
        self.registered.iter().cloned().collect()
    }
}

fn build_from_pfn(pfn: &str, scope: &str, details: PfnDetails) -> Result<FileRecord, String> {
    let parts = parse_pfn(pfn);
    let lfn = match details.lfn {
        Some(lfn) => lfn,
        None if !parts.filename.is_empty() => parts.filename.clone(),
        None => return Err("cannot derive LFN from PFN".into()),
    };

    let local = parts.is_local() && Path::new(pfn).is_file();
    let size = match details.size {
        Some(size) => size,
        None if local => std::fs::metadata(pfn).map_err(|e| e.to_string())?.len(),
        None => return Err("file size must be provided or file must be accessible".into()),
    };
    let checksum = match details.checksum {
        Some(checksum) => checksum,
        None if local => adler32_file(Path::new(pfn)).map_err(|e| e.to_string())?,
        None => return Err("checksum must be provided or file must be accessible".into()),
    };

    FileRecord::new(&lfn, pfn, size, &checksum, None, scope, details.metadata)
        .map_err(|e| e.to_string())
}
