#![allow(dead_code)]

use proptest::prelude::*;
use proptest::strategy::BoxedStrategy;
use proptest::test_runner::{Config as ProptestConfig, FileFailurePersistence};

pub fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(64);

    let mut config = ProptestConfig::with_failure_persistence(FileFailurePersistence::WithSource(
        "proptest-regressions",
    ));
    config.cases = cases;
    config.max_shrink_iters = 1024;
    config
}

/// Dot-free identifier segment.
pub fn arb_segment() -> BoxedStrategy<String> {
    proptest::string::string_regex("[a-z0-9_-]{1,12}")
        .expect("valid segment regex")
        .boxed()
}

/// Scope that is not a `user`/`group` scope.
pub fn arb_plain_scope() -> BoxedStrategy<String> {
    proptest::collection::vec(arb_segment(), 1..=3)
        .prop_filter("user and group prefixes resolve differently", |parts| {
            !parts[0].starts_with("user") && !parts[0].starts_with("group")
        })
        .prop_map(|parts| parts.join("."))
        .boxed()
}

/// `user.<x>` or `group.<x>` scope.
pub fn arb_personal_scope() -> BoxedStrategy<String> {
    (prop_oneof![Just("user"), Just("group")], arb_segment())
        .prop_map(|(kind, owner)| format!("{}.{}", kind, owner))
        .boxed()
}

/// Dotted name with one to three segments.
pub fn arb_name() -> BoxedStrategy<String> {
    proptest::collection::vec(arb_segment(), 1..=3)
        .prop_map(|parts| parts.join("."))
        .boxed()
}

/// `ad:` checksum of eight hex digits.
pub fn arb_adler32() -> BoxedStrategy<String> {
    any::<u32>()
        .prop_map(|value| format!("ad:{:08x}", value))
        .boxed()
}
