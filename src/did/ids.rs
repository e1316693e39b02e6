//! Generated identifiers attached to catalog entities.

use md5::{Digest, Md5};
use uuid::Uuid;

/// Generates a random GUID for a file, in canonical hyphenated form.
pub fn generate_guid() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

/// Formats a GUID in the canonical 8-4-4-4-12 layout.
///
/// Hyphens are stripped first; input that does not come down to exactly
/// 32 characters is returned unchanged.
pub fn format_guid(guid: &str) -> String {
    let clean: String = guid.chars().filter(|c| *c != '-').collect();
    if clean.len() == 32 && clean.is_ascii() {
        hyphenate(&clean)
    } else {
        guid.to_string()
    }
}

/// Derives the deterministic version identifier of a dataset.
///
/// The VUID is the MD5 digest of `scope:name`, laid out like a UUID, so the
/// same dataset always gets the same VUID.
pub fn generate_vuid(scope: &str, name: &str) -> String {
    let digest = Md5::digest(format!("{}:{}", scope, name).as_bytes());
    hyphenate(&format!("{:x}", digest))
}

fn hyphenate(hex: &str) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
