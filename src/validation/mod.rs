//! Input validation for catalog identifiers and file descriptions.
//!
//! Every check here runs before a request is built, so malformed input
//! never reaches the catalog. Each function returns `Ok(())` or a
//! [`WorkflowError::Validation`] describing the first violation found.
//!
//! The [`report`] submodule holds the structured report used when a whole
//! configuration is checked at once.

mod report;

pub use report::{IssueCode, IssueContext, Severity, ValidationIssue, ValidationReport};

use std::path::Path;

use crate::error::WorkflowError;

/// Longest accepted scope or dataset name.
pub const MAX_NAME_LEN: usize = 255;

/// Longest accepted logical file name.
pub const MAX_LFN_LEN: usize = 1024;

/// Validates a dataset name, combined (`scope:name`) or bare.
///
/// The colon is a legal separator, so it is removed before the character
/// check; everything else must come from `[A-Za-z0-9._-]`.
pub fn validate_name(name: &str) -> Result<(), WorkflowError> {
    if name.is_empty() {
        return Err(WorkflowError::validation("Dataset name cannot be empty"));
    }

    if name.chars().count() > MAX_NAME_LEN {
        return Err(WorkflowError::validation(format!(
            "Dataset name too long (max {} characters)",
            MAX_NAME_LEN
        )));
    }

    if !name.chars().filter(|c| *c != ':').all(is_name_char) {
        return Err(WorkflowError::validation(format!(
            "Dataset name contains invalid characters: '{}'",
            name
        )));
    }

    Ok(())
}

/// Validates a scope. Unlike names, a scope never contains a colon.
pub fn validate_scope(scope: &str) -> Result<(), WorkflowError> {
    if scope.is_empty() {
        return Err(WorkflowError::validation("Scope cannot be empty"));
    }

    if scope.chars().count() > MAX_NAME_LEN {
        return Err(WorkflowError::validation(format!(
            "Scope too long (max {} characters)",
            MAX_NAME_LEN
        )));
    }

    if !scope.chars().all(is_name_char) {
        return Err(WorkflowError::validation(format!(
            "Scope contains invalid characters: '{}'",
            scope
        )));
    }

    Ok(())
}

/// Validates a logical file name.
pub fn validate_lfn(lfn: &str) -> Result<(), WorkflowError> {
    if lfn.is_empty() {
        return Err(WorkflowError::validation("LFN cannot be empty"));
    }

    if lfn.chars().count() > MAX_LFN_LEN {
        return Err(WorkflowError::validation(format!(
            "LFN too long (max {} characters)",
            MAX_LFN_LEN
        )));
    }

    Ok(())
}

/// Validates a physical file location: either `scheme://...` or an
/// absolute filesystem path.
pub fn validate_pfn(pfn: &str) -> Result<(), WorkflowError> {
    if pfn.is_empty() {
        return Err(WorkflowError::validation("PFN cannot be empty"));
    }

    if let Some((scheme, rest)) = pfn.split_once("://") {
        if !is_valid_scheme(scheme) || rest.is_empty() {
            return Err(WorkflowError::validation(format!(
                "Invalid PFN URL format: '{}'",
                pfn
            )));
        }
    } else if !Path::new(pfn).is_absolute() {
        return Err(WorkflowError::validation(format!(
            "PFN must be an absolute path: '{}'",
            pfn
        )));
    }

    Ok(())
}

/// Validates a tagged checksum string: `md5:` + 32 hex digits or
/// `ad:` + 8 hex digits.
pub fn validate_checksum(checksum: &str) -> Result<(), WorkflowError> {
    if checksum.is_empty() {
        return Err(WorkflowError::validation("Checksum cannot be empty"));
    }

    if let Some(hash) = checksum.strip_prefix("md5:") {
        if !is_hex_of_len(hash, 32) {
            return Err(WorkflowError::validation("Invalid MD5 hash format"));
        }
    } else if let Some(hash) = checksum.strip_prefix("ad:") {
        if !is_hex_of_len(hash, 8) {
            return Err(WorkflowError::validation("Invalid Adler32 hash format"));
        }
    } else {
        return Err(WorkflowError::validation(
            "Unsupported checksum format (use md5: or ad:)",
        ));
    }

    Ok(())
}

/// Validates a file size as it arrives from loosely typed input.
pub fn validate_file_size(size: i64) -> Result<u64, WorkflowError> {
    u64::try_from(size)
        .map_err(|_| WorkflowError::validation("File size must be a non-negative integer"))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_accept_colon_separator() {
        assert!(validate_name("user.pilot:dataset_1-a").is_ok());
        assert!(validate_name("user.pilot.dataset").is_ok());
    }

    #[test]
    fn names_reject_bad_input() {
        assert!(validate_name("").is_err());
        assert!(validate_name("user pilot").is_err());
        assert!(validate_name("user/pilot").is_err());
        assert!(validate_name(&"a".repeat(256)).is_err());
        assert!(validate_name(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn scope_rejects_colon() {
        assert!(validate_scope("user.pilot").is_ok());
        assert!(validate_scope("user:pilot").is_err());
        assert!(validate_scope("").is_err());
    }

    #[test]
    fn lfn_length_limit() {
        assert!(validate_lfn("file.root").is_ok());
        assert!(validate_lfn("").is_err());
        assert!(validate_lfn(&"x".repeat(1024)).is_ok());
        assert!(validate_lfn(&"x".repeat(1025)).is_err());
    }

    #[test]
    fn pfn_forms() {
        assert!(validate_pfn("/data/file.root").is_ok());
        assert!(validate_pfn("root://eos.cern.ch:1094//eos/file.root").is_ok());
        assert!(validate_pfn("davs://storage.example.org/path").is_ok());
        assert!(validate_pfn("relative/path.root").is_err());
        assert!(validate_pfn("1abc://host/path").is_err());
        assert!(validate_pfn("root://").is_err());
        assert!(validate_pfn("").is_err());
    }

    #[test]
    fn checksum_forms() {
        assert!(validate_checksum("ad:12345678").is_ok());
        assert!(validate_checksum("ad:ABCDEF01").is_ok());
        assert!(validate_checksum(&format!("md5:{}", "a".repeat(32))).is_ok());

        let err = validate_checksum("invalid:checksum").unwrap_err();
        assert!(err.to_string().contains("Unsupported checksum format"));
        let err = validate_checksum("md5:tooShort").unwrap_err();
        assert!(err.to_string().contains("Invalid MD5 hash format"));
        assert!(validate_checksum("ad:1234567g").is_err());
        assert!(validate_checksum("").is_err());
    }

    #[test]
    fn file_size_must_be_non_negative() {
        assert_eq!(validate_file_size(0).unwrap(), 0);
        assert_eq!(validate_file_size(1024).unwrap(), 1024);
        assert!(matches!(
            validate_file_size(-1),
            Err(WorkflowError::Validation(_))
        ));
    }
}
