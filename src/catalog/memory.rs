//! An in-process catalog.
//!
//! Behaves like the remote service for everything the workflow touches:
//! datasets open and close, replicas are tracked per RSE, attachments are
//! all-or-nothing and duplicates come back as [`Outcome::AlreadyExists`].
//! It backs the CLI's `--dry-run` mode and the test suite, which also uses
//! its [`Faults`] switches to simulate partial failures.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde_json::Value;

use super::{
    Catalog, CatalogError, CatalogErrorKind, CatalogResult, DidInfo, DidType, FileEntry,
    FilePayload, Metadata, Outcome, ReplicaEntry,
};
use crate::did::Did;

/// Failure switches for simulating an unhealthy catalog.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// `add_replicas` with more than one file fails outright.
    pub fail_replica_batches: bool,
    /// `add_replicas` fails for every request.
    pub fail_all_replicas: bool,
    /// `add_replicas` rejects any request containing one of these LFNs.
    pub rejected_lfns: BTreeSet<String>,
    /// Attaching content to a dataset fails.
    pub fail_attach: bool,
    /// Opening or closing a DID fails.
    pub fail_status: bool,
    /// Setting a metadata key fails.
    pub fail_set_metadata: bool,
    /// Reading metadata fails.
    pub fail_get_metadata: bool,
    /// Listing replicas fails.
    pub fail_list_replicas: bool,
}

/// How often each mutating operation was called.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub add_dataset: usize,
    pub set_status: usize,
    pub set_metadata: usize,
    pub attach: usize,
    pub add_replicas: usize,
}

#[derive(Clone, Debug)]
struct Entry {
    did_type: DidType,
    open: bool,
    meta: Metadata,
    bytes: Option<u64>,
    adler32: Option<String>,
    md5: Option<String>,
    children: Vec<Did>,
}

impl Entry {
    fn collection(did_type: DidType, meta: Metadata) -> Self {
        Self {
            did_type,
            open: true,
            meta,
            bytes: None,
            adler32: None,
            md5: None,
            children: Vec::new(),
        }
    }

    fn file(payload: &FilePayload) -> Self {
        Self {
            did_type: DidType::File,
            open: false,
            meta: payload.meta.clone(),
            bytes: payload.bytes,
            adler32: payload.adler32.clone(),
            md5: payload.md5.clone(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    dids: BTreeMap<Did, Entry>,
    replicas: BTreeMap<Did, BTreeMap<String, Vec<String>>>,
    faults: Faults,
    calls: CallCounts,
}

/// A catalog held entirely in memory.
#[derive(Debug)]
pub struct InMemoryCatalog {
    account: String,
    state: Mutex<State>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    /// Creates an empty catalog acting as account `memory`.
    pub fn new() -> Self {
        Self::with_account("memory")
    }

    pub fn with_account(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Replaces the active failure switches.
    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().faults = faults;
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls.clone()
    }

    /// Open flag of a dataset, if it exists.
    pub fn is_open(&self, did: &Did) -> Option<bool> {
        self.state.lock().dids.get(did).map(|entry| entry.open)
    }

    /// DIDs attached to a dataset, in attachment order.
    pub fn contents(&self, did: &Did) -> Vec<Did> {
        self.state
            .lock()
            .dids
            .get(did)
            .map(|entry| entry.children.clone())
            .unwrap_or_default()
    }

    /// Registers a bare file DID with no replica, as if created elsewhere.
    pub fn insert_file(&self, did: &Did, bytes: u64) {
        let mut payload = FilePayload::bare(did);
        payload.bytes = Some(bytes);
        self.state
            .lock()
            .dids
            .insert(did.clone(), Entry::file(&payload));
    }

    fn not_found<T>(did: &Did) -> CatalogResult<T> {
        Ok(Outcome::NotFound(format!("Data identifier not found: {}", did)))
    }
}

impl State {
    fn attach(&mut self, target: &Did, children: &[Did]) -> CatalogResult<()> {
        self.calls.attach += 1;
        if self.faults.fail_attach {
            return Err(CatalogError::new(
                CatalogErrorKind::Server { status: 500 },
                format!("attach to {} failed", target),
            ));
        }

        let Some(entry) = self.dids.get(target) else {
            return InMemoryCatalog::not_found(target);
        };
        if entry.did_type == DidType::File {
            return Err(CatalogError::new(
                CatalogErrorKind::Unsupported,
                format!("cannot attach to file {}", target),
            ));
        }
        if !entry.open {
            return Err(CatalogError::new(
                CatalogErrorKind::Unsupported,
                format!("{} is closed", target),
            ));
        }

        for child in children {
            if !self.dids.contains_key(child) {
                return InMemoryCatalog::not_found(child);
            }
            if entry.children.contains(child) {
                return Ok(Outcome::AlreadyExists(format!(
                    "{} is already attached to {}",
                    child, target
                )));
            }
        }

        let mut unique: BTreeSet<&Did> = BTreeSet::new();
        for child in children {
            if !unique.insert(child) {
                return Ok(Outcome::AlreadyExists(format!(
                    "{} appears twice in the request",
                    child
                )));
            }
        }

        if let Some(entry) = self.dids.get_mut(target) {
            entry.children.extend(children.iter().cloned());
        }
        Ok(Outcome::Done(()))
    }

    fn register(&mut self, rse: &str, files: &[FilePayload]) -> CatalogResult<()> {
        for file in files {
            let did = file.did();
            if let Some(existing) = self.dids.get(&did) {
                if existing.did_type != DidType::File {
                    return Err(CatalogError::new(
                        CatalogErrorKind::Rejected,
                        format!("{} is not a file", did),
                    ));
                }
                if let (Some(known), Some(sent)) = (existing.bytes, file.bytes) {
                    if known != sent {
                        return Err(CatalogError::new(
                            CatalogErrorKind::Rejected,
                            format!("size mismatch for {}: {} != {}", did, known, sent),
                        ));
                    }
                }
            }
            let present = self
                .replicas
                .get(&did)
                .map(|rses| rses.contains_key(rse))
                .unwrap_or(false);
            if present {
                return Ok(Outcome::AlreadyExists(format!(
                    "Replica {} already exists at {}",
                    did, rse
                )));
            }
        }

        for file in files {
            let did = file.did();
            self.dids
                .entry(did.clone())
                .or_insert_with(|| Entry::file(file));
            let pfns = file.pfn.iter().cloned().collect();
            self.replicas
                .entry(did)
                .or_default()
                .insert(rse.to_string(), pfns);
        }
        Ok(Outcome::Done(()))
    }
}

impl Catalog for InMemoryCatalog {
    fn account(&self) -> &str {
        &self.account
    }

    fn add_dataset(&self, did: &Did, meta: &Metadata) -> CatalogResult<()> {
        let mut state = self.state.lock();
        state.calls.add_dataset += 1;
        if state.dids.contains_key(did) {
            return Ok(Outcome::AlreadyExists(format!(
                "Data identifier already exists: {}",
                did
            )));
        }
        state
            .dids
            .insert(did.clone(), Entry::collection(DidType::Dataset, meta.clone()));
        Ok(Outcome::Done(()))
    }

    fn set_status(&self, did: &Did, open: bool) -> CatalogResult<()> {
        let mut state = self.state.lock();
        state.calls.set_status += 1;
        if state.faults.fail_status {
            return Err(CatalogError::new(
                CatalogErrorKind::Server { status: 500 },
                format!("status update of {} failed", did),
            ));
        }
        let Some(entry) = state.dids.get_mut(did) else {
            return Self::not_found(did);
        };
        if entry.did_type == DidType::File {
            return Err(CatalogError::new(
                CatalogErrorKind::Unsupported,
                format!("cannot change status of file {}", did),
            ));
        }
        entry.open = open;
        Ok(Outcome::Done(()))
    }

    fn set_metadata(&self, did: &Did, key: &str, value: &Value) -> CatalogResult<()> {
        let mut state = self.state.lock();
        state.calls.set_metadata += 1;
        if state.faults.fail_set_metadata {
            return Err(CatalogError::new(
                CatalogErrorKind::Server { status: 500 },
                format!("setting {} on {} failed", key, did),
            ));
        }
        let Some(entry) = state.dids.get_mut(did) else {
            return Self::not_found(did);
        };
        entry.meta.insert(key.to_string(), value.clone());
        Ok(Outcome::Done(()))
    }

    fn get_metadata(&self, did: &Did) -> CatalogResult<Metadata> {
        let state = self.state.lock();
        if state.faults.fail_get_metadata {
            return Err(CatalogError::new(
                CatalogErrorKind::Transport,
                format!("metadata lookup of {} timed out", did),
            ));
        }
        let Some(entry) = state.dids.get(did) else {
            return Self::not_found(did);
        };
        let mut meta = entry.meta.clone();
        meta.insert("scope".into(), Value::from(did.scope.clone()));
        meta.insert("name".into(), Value::from(did.name.clone()));
        meta.insert("did_type".into(), serde_json::to_value(entry.did_type).unwrap_or(Value::Null));
        meta.insert("is_open".into(), Value::from(entry.open));
        if let Some(bytes) = entry.bytes {
            meta.insert("bytes".into(), Value::from(bytes));
        }
        if entry.did_type != DidType::File {
            meta.insert("length".into(), Value::from(entry.children.len()));
        }
        Ok(Outcome::Done(meta))
    }

    fn get_did(&self, did: &Did) -> CatalogResult<DidInfo> {
        let state = self.state.lock();
        match state.dids.get(did) {
            Some(entry) => Ok(Outcome::Done(DidInfo {
                scope: did.scope.clone(),
                name: did.name.clone(),
                did_type: entry.did_type,
                open: (entry.did_type != DidType::File).then_some(entry.open),
            })),
            None => Self::not_found(did),
        }
    }

    fn attach_dids(&self, did: &Did, dids: &[Did]) -> CatalogResult<()> {
        self.state.lock().attach(did, dids)
    }

    fn add_replicas(&self, rse: &str, files: &[FilePayload]) -> CatalogResult<()> {
        let mut state = self.state.lock();
        state.calls.add_replicas += 1;

        if state.faults.fail_all_replicas {
            return Err(CatalogError::new(
                CatalogErrorKind::Server { status: 500 },
                "replica registration is unavailable",
            ));
        }
        if state.faults.fail_replica_batches && files.len() > 1 {
            return Err(CatalogError::new(
                CatalogErrorKind::Server { status: 503 },
                format!("batch of {} replicas timed out", files.len()),
            ));
        }
        if let Some(rejected) = files
            .iter()
            .find(|file| state.faults.rejected_lfns.contains(&file.name))
        {
            return Err(CatalogError::new(
                CatalogErrorKind::Rejected,
                format!("replica {} rejected", rejected.name),
            ));
        }

        state.register(rse, files)
    }

    fn add_files_to_dataset(
        &self,
        did: &Did,
        files: &[FilePayload],
        rse: Option<&str>,
    ) -> CatalogResult<()> {
        let mut state = self.state.lock();
        if !state.dids.contains_key(did) {
            return Self::not_found(did);
        }

        let missing: Vec<FilePayload> = files
            .iter()
            .filter(|file| !state.dids.contains_key(&file.did()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            match rse {
                Some(rse) if missing.iter().all(|file| file.bytes.is_some()) => {
                    if let Outcome::NotFound(message) = state.register(rse, &missing)? {
                        return Ok(Outcome::NotFound(message));
                    }
                }
                _ => return Self::not_found(&missing[0].did()),
            }
        }

        let children: Vec<Did> = files.iter().map(FilePayload::did).collect();
        state.attach(did, &children)
    }

    fn list_files(&self, did: &Did, _long: bool) -> CatalogResult<Vec<FileEntry>> {
        let state = self.state.lock();
        let Some(entry) = state.dids.get(did) else {
            return Self::not_found(did);
        };

        let files = entry
            .children
            .iter()
            .filter_map(|child| {
                let file = state.dids.get(child)?;
                (file.did_type == DidType::File).then(|| FileEntry {
                    scope: child.scope.clone(),
                    name: child.name.clone(),
                    bytes: file.bytes.unwrap_or(0),
                    adler32: file.adler32.clone(),
                    md5: file.md5.clone(),
                    guid: file
                        .meta
                        .get("guid")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    events: file.meta.get("events").cloned(),
                    lumiblocknr: file.meta.get("lumiblocknr").cloned(),
                })
            })
            .collect();
        Ok(Outcome::Done(files))
    }

    fn list_replicas(&self, dids: &[Did], rse: Option<&str>) -> CatalogResult<Vec<ReplicaEntry>> {
        let state = self.state.lock();
        if state.faults.fail_list_replicas {
            return Err(CatalogError::new(
                CatalogErrorKind::Server { status: 503 },
                "replica listing is unavailable",
            ));
        }
        let entries = dids
            .iter()
            .filter_map(|did| {
                let file = state.dids.get(did)?;
                let rses = state
                    .replicas
                    .get(did)
                    .map(|known| {
                        known
                            .iter()
                            .filter(|(name, _)| rse.map_or(true, |wanted| wanted == name.as_str()))
                            .map(|(name, pfns)| (name.clone(), pfns.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(ReplicaEntry {
                    scope: did.scope.clone(),
                    name: did.name.clone(),
                    bytes: file.bytes,
                    rses,
                })
            })
            .collect();
        Ok(Outcome::Done(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str, bytes: u64) -> FilePayload {
        let mut payload = FilePayload::bare(&Did::new("user.test", name));
        payload.bytes = Some(bytes);
        payload.pfn = Some(format!("/data/{}", name));
        payload.adler32 = Some("12345678".into());
        payload
    }

    #[test]
    fn dataset_creation_reports_duplicates() {
        let catalog = InMemoryCatalog::new();
        let did = Did::new("user.test", "ds");
        assert_eq!(catalog.add_dataset(&did, &Metadata::new()).unwrap(), Outcome::Done(()));
        assert!(matches!(
            catalog.add_dataset(&did, &Metadata::new()).unwrap(),
            Outcome::AlreadyExists(_)
        ));
        assert_eq!(catalog.is_open(&did), Some(true));
    }

    #[test]
    fn duplicate_replica_batch_changes_nothing() {
        let catalog = InMemoryCatalog::new();
        catalog.add_replicas("DISK", &[payload("a.root", 1)]).unwrap();

        let outcome = catalog
            .add_replicas("DISK", &[payload("b.root", 2), payload("a.root", 1)])
            .unwrap();
        assert!(matches!(outcome, Outcome::AlreadyExists(_)));

        let replicas = catalog
            .list_replicas(&[Did::new("user.test", "b.root")], None)
            .unwrap()
            .done()
            .unwrap();
        assert!(replicas.is_empty());
    }

    #[test]
    fn attach_to_closed_dataset_is_unsupported() {
        let catalog = InMemoryCatalog::new();
        let did = Did::new("user.test", "ds");
        catalog.add_dataset(&did, &Metadata::new()).unwrap();
        catalog.add_replicas("DISK", &[payload("a.root", 1)]).unwrap();
        catalog.set_status(&did, false).unwrap();

        let err = catalog
            .attach_dids(&did, &[Did::new("user.test", "a.root")])
            .unwrap_err();
        assert_eq!(err.kind, CatalogErrorKind::Unsupported);
    }

    #[test]
    fn add_files_registers_missing_files_with_rse() {
        let catalog = InMemoryCatalog::new();
        let did = Did::new("user.test", "ds");
        catalog.add_dataset(&did, &Metadata::new()).unwrap();

        let outcome = catalog
            .add_files_to_dataset(&did, &[payload("a.root", 10)], Some("DISK"))
            .unwrap();
        assert_eq!(outcome, Outcome::Done(()));
        assert_eq!(catalog.contents(&did), vec![Did::new("user.test", "a.root")]);

        let without_rse = catalog
            .add_files_to_dataset(&did, &[payload("b.root", 10)], None)
            .unwrap();
        assert!(matches!(without_rse, Outcome::NotFound(_)));
    }

    #[test]
    fn faults_fail_batches_but_not_singles() {
        let catalog = InMemoryCatalog::new();
        catalog.set_faults(Faults {
            fail_replica_batches: true,
            ..Faults::default()
        });

        assert!(catalog
            .add_replicas("DISK", &[payload("a.root", 1), payload("b.root", 2)])
            .is_err());
        assert!(catalog.add_replicas("DISK", &[payload("a.root", 1)]).is_ok());
        assert_eq!(catalog.calls().add_replicas, 2);
    }

    #[test]
    fn metadata_reports_state_fields() {
        let catalog = InMemoryCatalog::new();
        let did = Did::new("user.test", "ds");
        catalog.add_dataset(&did, &Metadata::new()).unwrap();
        catalog
            .set_metadata(&did, "lifetime", &Value::from(3600))
            .unwrap();

        let meta = catalog.get_metadata(&did).unwrap().done().unwrap();
        assert_eq!(meta["is_open"], Value::from(true));
        assert_eq!(meta["did_type"], Value::from("DATASET"));
        assert_eq!(meta["lifetime"], Value::from(3600));
    }
}
