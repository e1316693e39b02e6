//! The catalog service the workflow talks to.
//!
//! This module owns the contract only: the [`Catalog`] trait, the request
//! and response shapes, and the [`Outcome`] of a call. Benign races such as
//! "already exists" and "not found" are ordinary outcomes rather than
//! errors, so every tolerance decision made by the services is a visible
//! `match` arm.
//!
//! Two implementations ship with the crate: [`memory::InMemoryCatalog`] and,
//! behind the `rest` feature, [`rest::RestCatalog`].

pub mod memory;
#[cfg(feature = "rest")]
pub mod rest;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::did::Did;

/// Arbitrary key/value metadata. Ordering carries no meaning.
pub type Metadata = BTreeMap<String, Value>;

/// What a catalog call ended with, short of a genuine failure.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<T> {
    /// The call did what was asked.
    Done(T),
    /// The target already existed.
    AlreadyExists(String),
    /// The target (or its parent) does not exist.
    NotFound(String),
}

impl<T> Outcome<T> {
    /// Returns the payload of a `Done` outcome.
    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            _ => None,
        }
    }
}

/// Result of one catalog call.
pub type CatalogResult<T> = Result<Outcome<T>, CatalogError>;

/// A catalog call that failed for real.
#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct CatalogError {
    pub kind: CatalogErrorKind,
    pub message: String,
}

impl CatalogError {
    pub fn new(kind: CatalogErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Classification of a catalog failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogErrorKind {
    /// The request never got a response.
    Transport,
    /// The server answered with an error status.
    Server { status: u16 },
    /// The operation is not supported for this target (e.g. closing a file).
    Unsupported,
    /// The response could not be decoded.
    Decode,
    /// The catalog refused the request contents.
    Rejected,
}

impl std::fmt::Display for CatalogErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogErrorKind::Transport => write!(f, "transport failure"),
            CatalogErrorKind::Server { status } => write!(f, "server error ({})", status),
            CatalogErrorKind::Unsupported => write!(f, "unsupported operation"),
            CatalogErrorKind::Decode => write!(f, "undecodable response"),
            CatalogErrorKind::Rejected => write!(f, "request rejected"),
        }
    }
}

/// Kind of catalog entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DidType {
    File,
    Dataset,
    Container,
}

/// A DID as the catalog describes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DidInfo {
    pub scope: String,
    pub name: String,
    #[serde(rename = "type")]
    pub did_type: DidType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
}

/// One file as sent to the catalog for replica registration or dataset
/// attachment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilePayload {
    pub scope: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pfn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adler32: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub meta: Metadata,
}

impl FilePayload {
    /// A payload carrying only the file's identity.
    pub fn bare(did: &Did) -> Self {
        Self {
            scope: did.scope.clone(),
            name: did.name.clone(),
            bytes: None,
            pfn: None,
            md5: None,
            adler32: None,
            meta: Metadata::new(),
        }
    }

    pub fn did(&self) -> Did {
        Did::new(self.scope.clone(), self.name.clone())
    }
}

/// One content entry of a dataset listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub scope: String,
    pub name: String,
    pub bytes: u64,
    #[serde(default)]
    pub adler32: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub events: Option<Value>,
    #[serde(default)]
    pub lumiblocknr: Option<Value>,
}

/// Replica locations of one file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicaEntry {
    pub scope: String,
    pub name: String,
    #[serde(default)]
    pub bytes: Option<u64>,
    /// RSE name to the PFNs known there.
    #[serde(default)]
    pub rses: BTreeMap<String, Vec<String>>,
}

/// The catalog operations the workflow consumes.
///
/// Every method is a blocking call. Implementations report benign races as
/// [`Outcome::AlreadyExists`] / [`Outcome::NotFound`] and reserve `Err` for
/// genuine failures.
pub trait Catalog: Send + Sync {
    /// Account the catalog session acts as.
    fn account(&self) -> &str;

    fn add_dataset(&self, did: &Did, meta: &Metadata) -> CatalogResult<()>;

    fn set_status(&self, did: &Did, open: bool) -> CatalogResult<()>;

    fn set_metadata(&self, did: &Did, key: &str, value: &Value) -> CatalogResult<()>;

    fn get_metadata(&self, did: &Did) -> CatalogResult<Metadata>;

    fn get_did(&self, did: &Did) -> CatalogResult<DidInfo>;

    /// Attaches existing DIDs to a dataset or container.
    fn attach_dids(&self, did: &Did, dids: &[Did]) -> CatalogResult<()>;

    /// Registers replicas at `rse`, creating the file DIDs as needed.
    fn add_replicas(&self, rse: &str, files: &[FilePayload]) -> CatalogResult<()>;

    /// Attaches files to a dataset, optionally registering them at `rse`.
    fn add_files_to_dataset(
        &self,
        did: &Did,
        files: &[FilePayload],
        rse: Option<&str>,
    ) -> CatalogResult<()>;

    fn list_files(&self, did: &Did, long: bool) -> CatalogResult<Vec<FileEntry>>;

    fn list_replicas(&self, dids: &[Did], rse: Option<&str>) -> CatalogResult<Vec<ReplicaEntry>>;
}
