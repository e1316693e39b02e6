//! Validated descriptions of physical files.
//!
//! A [`FileRecord`] can only be obtained through a constructor that runs
//! every validator, so a half-valid record never exists. Loosely typed
//! input (JSON file lists) goes through [`FileSpec`] and the same
//! constructor.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{FilePayload, Metadata};
use crate::did::ids::generate_guid;
use crate::did::Did;
use crate::error::WorkflowError;
use crate::validation::{
    validate_checksum, validate_file_size, validate_lfn, validate_pfn, validate_scope,
};

/// Read size used when checksumming local files.
const CHUNK_SIZE: usize = 64 * 1024;

/// A file checksum tagged with its algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Checksum {
    /// 32 hex digits.
    Md5(String),
    /// 8 hex digits.
    Adler32(String),
}

impl Checksum {
    /// Parses `md5:<hex>` or `ad:<hex>`.
    pub fn parse(value: &str) -> Result<Self, WorkflowError> {
        validate_checksum(value)?;
        if let Some(hash) = value.strip_prefix("md5:") {
            Ok(Checksum::Md5(hash.to_string()))
        } else {
            let hash = value.strip_prefix("ad:").unwrap_or(value);
            Ok(Checksum::Adler32(hash.to_string()))
        }
    }

    /// The bare hex digest.
    pub fn value(&self) -> &str {
        match self {
            Checksum::Md5(hash) | Checksum::Adler32(hash) => hash,
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksum::Md5(hash) => write!(f, "md5:{}", hash),
            Checksum::Adler32(hash) => write!(f, "ad:{}", hash),
        }
    }
}

/// One entry of a JSON file list, before validation.
///
/// Keys other than the named ones (`events`, `file_type`, ...) are kept
/// as metadata.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileSpec {
    pub lfn: String,
    pub pfn: String,
    pub size: i64,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// A physical file and its catalog representation. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct FileRecord {
    lfn: String,
    pfn: String,
    size: u64,
    checksum: Checksum,
    guid: String,
    scope: String,
    metadata: Metadata,
}

impl FileRecord {
    /// Builds a record, validating every field.
    ///
    /// A GUID is generated when `guid` is `None`, and `filename` metadata
    /// defaults to the basename of the LFN.
    pub fn new(
        lfn: &str,
        pfn: &str,
        size: u64,
        checksum: &str,
        guid: Option<&str>,
        scope: &str,
        mut metadata: Metadata,
    ) -> Result<Self, WorkflowError> {
        validate_lfn(lfn)?;
        validate_pfn(pfn)?;
        let checksum = Checksum::parse(checksum)?;
        validate_scope(scope)?;

        if !metadata.contains_key("filename") {
            metadata.insert("filename".into(), Value::from(basename(lfn)));
        }

        Ok(Self {
            lfn: lfn.to_string(),
            pfn: pfn.to_string(),
            size,
            checksum,
            guid: guid.map_or_else(generate_guid, str::to_string),
            scope: scope.to_string(),
            metadata,
        })
    }

    /// Builds a record from a file-list entry. `default_scope` applies when
    /// the entry names none.
    pub fn from_spec(spec: FileSpec, default_scope: Option<&str>) -> Result<Self, WorkflowError> {
        let size = validate_file_size(spec.size)?;
        let scope = spec
            .scope
            .as_deref()
            .or(default_scope)
            .ok_or_else(|| {
                WorkflowError::validation(format!("File {} has no scope", spec.lfn))
            })?;

        Self::new(
            &spec.lfn,
            &spec.pfn,
            size,
            &spec.checksum,
            spec.guid.as_deref(),
            scope,
            spec.metadata,
        )
    }

    pub fn lfn(&self) -> &str {
        &self.lfn
    }

    pub fn pfn(&self) -> &str {
        &self.pfn
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn did(&self) -> Did {
        Did::new(self.scope.clone(), self.lfn.clone())
    }

    /// Builds the replica registration payload.
    ///
    /// Fails when caller metadata carries a `guid` that disagrees with the
    /// record's own.
    pub fn replica_payload(&self) -> Result<FilePayload, WorkflowError> {
        if let Some(meta_guid) = self.metadata.get("guid") {
            if meta_guid.as_str() != Some(self.guid.as_str()) {
                return Err(WorkflowError::registration(format!(
                    "metadata guid {} conflicts with record guid {} for {}",
                    meta_guid, self.guid, self.lfn
                )));
            }
        }

        let mut meta = Metadata::new();
        meta.insert("guid".into(), Value::from(self.guid.clone()));
        meta.extend(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

        let (md5, adler32) = match &self.checksum {
            Checksum::Md5(hash) => (Some(hash.clone()), None),
            Checksum::Adler32(hash) => (None, Some(hash.clone())),
        };

        Ok(FilePayload {
            scope: self.scope.clone(),
            name: self.lfn.clone(),
            bytes: Some(self.size),
            pfn: Some(self.pfn.clone()),
            md5,
            adler32,
            meta,
        })
    }

    /// Builds the dataset attachment payload: the replica payload without
    /// the physical location.
    pub fn attach_payload(&self) -> Result<FilePayload, WorkflowError> {
        let mut payload = self.replica_payload()?;
        payload.pfn = None;
        Ok(payload)
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileRecord(lfn={}, scope={}, size={})",
            self.lfn, self.scope, self.size
        )
    }
}

/// Components of a physical file location.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PfnParts {
    pub protocol: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub filename: String,
}

impl PfnParts {
    /// True when the PFN names a path on this machine.
    pub fn is_local(&self) -> bool {
        self.protocol.is_empty()
    }
}

/// Splits a PFN into protocol, host, port, path and filename.
///
/// Bracketed IPv6 hosts are left whole, port included.
pub fn parse_pfn(pfn: &str) -> PfnParts {
    let mut parts = PfnParts::default();

    let Some((protocol, rest)) = pfn.split_once("://") else {
        parts.path = pfn.to_string();
        parts.filename = basename(pfn).to_string();
        return parts;
    };
    parts.protocol = protocol.to_string();

    let Some((host_port, path)) = rest.split_once('/') else {
        parts.host = rest.to_string();
        return parts;
    };
    parts.path = format!("/{}", path);
    parts.filename = basename(path).to_string();

    match host_port.rsplit_once(':') {
        Some((host, port)) if !host_port.starts_with('[') => {
            parts.host = host.to_string();
            parts.port = port.to_string();
        }
        _ => parts.host = host_port.to_string(),
    }

    parts
}

/// Computes the Adler-32 checksum of a local file as `ad:<8 hex>`.
pub fn adler32_file(path: &Path) -> Result<String, std::io::Error> {
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, File::open(path)?);
    let mut hasher = adler2::Adler32::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.write_slice(&buf[..read]);
    }

    Ok(format!("ad:{:08x}", hasher.checksum()))
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(lfn: &str, checksum: &str) -> Result<FileRecord, WorkflowError> {
        FileRecord::new(
            lfn,
            "/data/test/file.root",
            1024,
            checksum,
            None,
            "user.test",
            Metadata::new(),
        )
    }

    #[test]
    fn record_generates_guid_and_filename() {
        let rec = record("dir/test_file1.root", "ad:12345678").unwrap();
        assert_eq!(rec.guid().len(), 36);
        assert_eq!(rec.metadata()["filename"], Value::from("test_file1.root"));
        assert_eq!(rec.checksum(), &Checksum::Adler32("12345678".into()));
    }

    #[test]
    fn record_construction_is_all_or_nothing() {
        assert!(record("", "ad:12345678").is_err());
        assert!(record("f.root", "md5:tooShort").is_err());
        assert!(FileRecord::new(
            "f.root",
            "relative.root",
            1,
            "ad:12345678",
            None,
            "user.test",
            Metadata::new()
        )
        .is_err());
        assert!(FileRecord::new(
            "f.root",
            "/abs.root",
            1,
            "ad:12345678",
            None,
            "bad scope",
            Metadata::new()
        )
        .is_err());
    }

    #[test]
    fn spec_takes_default_scope_and_keeps_extras() {
        let spec: FileSpec = serde_json::from_value(serde_json::json!({
            "lfn": "test_file1.root",
            "pfn": "/data/test/test_file1.root",
            "size": 1024,
            "checksum": "ad:12345678",
            "events": 100,
            "file_type": "data"
        }))
        .unwrap();

        let rec = FileRecord::from_spec(spec.clone(), Some("user.test")).unwrap();
        assert_eq!(rec.scope(), "user.test");
        assert_eq!(rec.metadata()["events"], Value::from(100));
        assert_eq!(rec.metadata()["file_type"], Value::from("data"));

        assert!(FileRecord::from_spec(spec, None).is_err());
    }

    #[test]
    fn spec_rejects_negative_size() {
        let spec = FileSpec {
            lfn: "f.root".into(),
            pfn: "/data/f.root".into(),
            size: -1,
            checksum: "ad:12345678".into(),
            scope: Some("user.test".into()),
            ..FileSpec::default()
        };
        assert!(matches!(
            FileRecord::from_spec(spec, None),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn payload_maps_checksum_and_guid() {
        let md5 = format!("md5:{}", "0123456789abcdef".repeat(2));
        let rec = record("f.root", &md5).unwrap();
        let payload = rec.replica_payload().unwrap();
        assert_eq!(payload.md5.as_deref(), Some("0123456789abcdef0123456789abcdef"));
        assert_eq!(payload.adler32, None);
        assert_eq!(payload.meta["guid"], Value::from(rec.guid()));
        assert_eq!(payload.pfn.as_deref(), Some("/data/test/file.root"));
        assert_eq!(rec.attach_payload().unwrap().pfn, None);
    }

    #[test]
    fn payload_rejects_conflicting_guid_metadata() {
        let mut meta = Metadata::new();
        meta.insert("guid".into(), Value::from("something-else"));
        let rec = FileRecord::new(
            "f.root",
            "/data/f.root",
            1,
            "ad:12345678",
            Some("01234567-89ab-cdef-0123-456789abcdef"),
            "user.test",
            meta,
        )
        .unwrap();
        assert!(matches!(
            rec.replica_payload(),
            Err(WorkflowError::FileRegistration(_))
        ));
    }

    #[test]
    fn parse_pfn_components() {
        let parts = parse_pfn("root://eos.cern.ch:1094//eos/atlas/file.root");
        assert_eq!(parts.protocol, "root");
        assert_eq!(parts.host, "eos.cern.ch");
        assert_eq!(parts.port, "1094");
        assert_eq!(parts.path, "//eos/atlas/file.root");
        assert_eq!(parts.filename, "file.root");

        let local = parse_pfn("/data/test/file.root");
        assert!(local.is_local());
        assert_eq!(local.filename, "file.root");

        let v6 = parse_pfn("davs://[::1]:443/path/f.root");
        assert_eq!(v6.host, "[::1]:443");
        assert_eq!(v6.port, "");

        let host_only = parse_pfn("srm://storage.example.org");
        assert_eq!(host_only.host, "storage.example.org");
        assert_eq!(host_only.filename, "");
    }

    #[test]
    fn adler32_of_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Wikipedia").unwrap();
        file.flush().unwrap();
        assert_eq!(adler32_file(file.path()).unwrap(), "ad:11e60398");
    }

    #[test]
    fn adler32_of_empty_file_is_one() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(adler32_file(file.path()).unwrap(), "ad:00000001");
    }
}
