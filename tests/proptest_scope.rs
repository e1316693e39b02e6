mod proptest_helpers;

use proptest::prelude::*;
use proptest_helpers::{arb_adler32, arb_name, arb_personal_scope, arb_plain_scope, arb_segment};
use rucio_workflow::did::{resolve_scope, Did};
use rucio_workflow::files::{Checksum, FileRecord};

proptest! {
    #![proptest_config(proptest_helpers::proptest_config())]

    #[test]
    fn explicit_colon_splits_exactly(scope in arb_plain_scope(), name in arb_name()) {
        let (s, n) = resolve_scope(&format!("{}:{}", scope, name), false).unwrap();
        prop_assert_eq!(s, scope);
        prop_assert_eq!(n, name);
    }

    #[test]
    fn personal_scopes_keep_two_segments(scope in arb_personal_scope(), name in arb_name()) {
        let (s, n) = resolve_scope(&format!("{}.{}", scope, name), false).unwrap();
        prop_assert_eq!(s, scope);
        prop_assert_eq!(n, name);
    }

    #[test]
    fn plain_dotted_form_splits_on_last_dot(scope in arb_plain_scope(), last in arb_segment()) {
        let (s, n) = resolve_scope(&format!("{}.{}", scope, last), false).unwrap();
        prop_assert_eq!(s, scope);
        prop_assert_eq!(n, last);
    }

    #[test]
    fn trailing_slash_is_optional(scope in arb_personal_scope(), name in arb_name()) {
        let plain = format!("{}:{}", scope, name);
        prop_assert_eq!(
            resolve_scope(&format!("{}/", plain), true).unwrap(),
            resolve_scope(&plain, false).unwrap()
        );
    }

    #[test]
    fn parsed_dids_display_as_scope_colon_name(scope in arb_personal_scope(), name in arb_name()) {
        let did = Did::parse(&format!("{}:{}", scope, name)).unwrap();
        prop_assert_eq!(did.to_string(), format!("{}:{}", scope, name));
    }

    #[test]
    fn records_keep_their_checksum(lfn in arb_name(), checksum in arb_adler32(), size in any::<u32>()) {
        let record = FileRecord::new(
            &lfn,
            &format!("/data/{}", lfn),
            u64::from(size),
            &checksum,
            None,
            "user.prop",
            Default::default(),
        )
        .unwrap();
        prop_assert_eq!(record.checksum().to_string(), checksum.clone());
        prop_assert!(matches!(record.checksum(), Checksum::Adler32(_)));
        prop_assert_eq!(record.size(), u64::from(size));
    }
}
