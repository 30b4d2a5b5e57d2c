//! Property tests over the pure cores.

use proptest::prelude::*;

use datagrid_adapters::ObjectKey;
use datagrid_core::checksum::{Checksum, ChecksumKind};
use datagrid_core::did::Did;
use datagrid_transfer::RetryPolicy;

proptest! {
    #[test]
    fn prop_did_display_parse_round_trip(
        scope in "[a-z][a-z0-9.]{0,20}",
        name in "[a-zA-Z0-9._/-]{1,60}",
    ) {
        let did = Did::new(&scope, &name).unwrap();
        let back = Did::parse(&did.to_string()).unwrap();
        prop_assert_eq!(did, back);
    }

    #[test]
    fn prop_object_key_round_trips_to_did(
        scope in "[a-z]{1,10}",
        name in "[a-zA-Z0-9._/-]{1,40}",
    ) {
        let did = Did::new(&scope, &name).unwrap();
        let key = ObjectKey::for_did(&did);
        let partial = key.partial_of();
        prop_assert!(partial.is_partial());
        prop_assert!(!key.is_partial());
        let finals = partial.final_of().unwrap();
        prop_assert_eq!(finals.to_did().unwrap(), did);
    }

    #[test]
    fn prop_checksum_verifies_only_exact_content(
        data in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let sum = Checksum::blake3_of(&data);
        prop_assert!(sum.verify(&data));
        prop_assert_eq!(sum.kind(), ChecksumKind::Blake3);
        let mut tampered = data.clone();
        tampered.push(0x5A);
        prop_assert!(!sum.verify(&tampered));
    }

    #[test]
    fn prop_backoff_never_exceeds_cap(attempts in 1u32..64) {
        let policy = RetryPolicy::default();
        prop_assert!(policy.backoff(attempts) <= policy.max_delay);
    }

    #[test]
    fn prop_backoff_without_jitter_is_monotone(attempts in 1u32..40) {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        prop_assert!(policy.backoff(attempts) <= policy.backoff(attempts + 1));
    }
}
