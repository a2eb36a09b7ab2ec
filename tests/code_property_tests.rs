//! Property-based tests for pickup code parsing, generation and lockout
//!
//! These check the rules that must hold for every input rather than for a
//! handful of picked cases: the shape of a code, the lockout arithmetic and
//! uniqueness of the codes a batch hands out.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use pickup_codes::{
    CodeError, PickupCodeService,
    authority::StaticAuthority,
    clock::ManualClock,
    code::{CODE_MAX, CODE_MIN, CodeGenerator, PlainCode},
    config::{CodePolicy, HashCost},
    lockout,
    model::{Package, PackageStatus, Shipment, ShipmentStatus, TimeStamp},
    notify::MemoryDispatcher,
};
use tempfile::tempdir;

// PROPERTY TEST STRATEGIES

/// Strategy to generate a point in time within a few years
fn timestamp_strategy() -> impl Strategy<Value = TimeStamp<Utc>> {
    (2024i32..=2030, 1u32..=12, 1u32..=28, 0u32..24, 0u32..60)
        .prop_map(|(year, month, day, hour, min)| TimeStamp::new_with(year, month, day, hour, min, 0))
}

/// Strategy to generate a lockout policy with small thresholds
fn policy_strategy() -> impl Strategy<Value = CodePolicy> {
    (1u32..=10, 1i64..=7200).prop_map(|(threshold, lockout_secs)| {
        let mut policy = CodePolicy::default();
        policy.lockout_threshold = threshold;
        policy.lockout_secs = lockout_secs;
        policy
    })
}

proptest! {
    /// Every value in range parses back to itself
    #[test]
    fn in_range_values_parse(value in CODE_MIN..=CODE_MAX) {
        let raw = value.to_string();
        let code: PlainCode = raw.parse().unwrap();
        prop_assert_eq!(code.as_str(), raw.as_str());
    }

    /// Anything that is not exactly six digits in range is rejected
    #[test]
    fn out_of_shape_input_is_rejected(raw in "[0-9a-z]{0,9}") {
        let well_formed = raw.len() == 6
            && raw.bytes().all(|b| b.is_ascii_digit())
            && !raw.starts_with('0');
        let parsed = raw.parse::<PlainCode>();
        prop_assert_eq!(parsed.is_ok(), well_formed);
        if !well_formed {
            prop_assert_eq!(parsed.unwrap_err(), CodeError::InvalidCode);
        }
    }

    /// Generated codes are always six digits in range, whatever the
    /// collision pattern the index reports
    #[test]
    fn generated_codes_stay_in_range(collisions in 0u32..20) {
        let generator = CodeGenerator::new(&CodePolicy::default());
        let mut seen = 0;
        let code = generator.generate(|_| {
            seen += 1;
            Ok(seen <= collisions)
        }).unwrap();
        let value: u32 = code.as_str().parse().unwrap();
        prop_assert!((CODE_MIN..=CODE_MAX).contains(&value));
        prop_assert_eq!(seen, collisions + 1);
    }

    /// Below the threshold a failure never locks; at the threshold it always
    /// does, for exactly the lockout window
    #[test]
    fn lock_trips_exactly_at_threshold(
        policy in policy_strategy(),
        prior in 0u32..12,
        now in timestamp_strategy(),
    ) {
        let outcome = lockout::register_failure(prior, None, &now, &policy);
        prop_assert_eq!(outcome.failed_attempts, prior + 1);
        if prior + 1 >= policy.lockout_threshold {
            prop_assert_eq!(outcome.locked_until, Some(now.plus(policy.lockout_duration())));
            prop_assert!(outcome.newly_locked);
        } else {
            prop_assert!(outcome.locked_until.is_none());
        }
    }

    /// A lock is in force strictly before its deadline and elapsed from it on
    #[test]
    fn lock_and_elapsed_partition_time(
        until in timestamp_strategy(),
        offset_secs in -7200i64..7200,
    ) {
        let now = until.plus(Duration::seconds(offset_secs));
        let locked = lockout::is_locked(Some(&until), &now);
        let elapsed = lockout::lock_elapsed(Some(&until), &now);
        prop_assert!(locked != elapsed);
        prop_assert_eq!(locked, offset_secs < 0);
        prop_assert!(!lockout::is_locked(None, &now));
        prop_assert!(!lockout::lock_elapsed(None, &now));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// No two packages of a batch share a code
    #[test]
    fn batch_codes_are_unique(count in 1usize..40) {
        let dir = tempdir().unwrap();
        let db = Arc::new(sled::open(dir.path().join("batch.db")).unwrap());
        let policy = CodePolicy::default()
            .set_hash_cost(HashCost::minimal())
            .set_index_key(b"property-key");
        let service = PickupCodeService::open_with_clock(
            db,
            policy,
            Arc::new(StaticAuthority::new()),
            Arc::new(MemoryDispatcher::new()),
            Arc::new(ManualClock::new(TimeStamp::new_with(2026, 6, 1, 9, 0, 0))),
        )
        .unwrap();

        let shipment = Shipment::new("PROP-1").unwrap().set_status(ShipmentStatus::Arrived);
        service.store().insert_shipment(&shipment).unwrap();
        for n in 0..count {
            let package = Package::new(&format!("TRK-{n}"), "user_1", "VC-001")
                .unwrap()
                .set_shipment(&shipment.shipment_id)
                .set_status(PackageStatus::Arrived);
            service.store().insert_package(&package).unwrap();
        }

        let batch = service.issue_codes_for_shipment(&shipment.shipment_id, None).unwrap();
        prop_assert_eq!(batch.generated, count);
        let distinct: HashSet<&str> = batch.codes.iter().map(|c| c.code.as_str()).collect();
        prop_assert_eq!(distinct.len(), count);
    }
}
