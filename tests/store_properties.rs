//! Property tests for the durable record store's ordering and deletion
//! guarantees.

use beacon::{InsertOutcome, PipelineConfig, RecordClass, RecordId, RecordStore, Timestamp};
use proptest::prelude::*;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> RecordStore {
    RecordStore::open(&PipelineConfig {
        storage_path: dir.path().join("queue"),
        ..Default::default()
    })
    .unwrap()
}

fn insert_n(store: &RecordStore, owner: &str, n: u64) {
    for i in 0..n {
        let outcome = store
            .insert(
                RecordClass::Event,
                format!("{{\"n\":{}}}", i).as_bytes(),
                owner,
                false,
                Timestamp(i as i64),
            )
            .unwrap();
        assert!(matches!(outcome, InsertOutcome::Stored { .. }));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Oldest-first reads return non-decreasing ids, the largest of
    /// which is the batch cutoff, under any insert count and limit.
    #[test]
    fn prop_batch_ids_nondecreasing_and_cutoff_is_max(n in 1u64..40, limit in 1u64..50) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        insert_n(&store, "owner", n);

        let batch = store.read_batch(RecordClass::Event, "owner", limit, true).unwrap();
        prop_assert_eq!(batch.records.len() as u64, n.min(limit));
        prop_assert_eq!(batch.owner_total, n);

        let ids: Vec<u64> = batch.records.iter().map(|r| r.id.0).collect();
        for pair in ids.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
        prop_assert_eq!(batch.cutoff.0, *ids.last().unwrap());
    }

    /// After deleting up to a cutoff, no id at or below it ever comes
    /// back, and a repeat delete removes nothing further.
    #[test]
    fn prop_delete_up_to_is_final_and_idempotent(n in 1u64..30, cutoff in 1u64..40) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        insert_n(&store, "owner", n);

        let cutoff = RecordId(cutoff);
        store.delete_up_to(RecordClass::Event, cutoff, "owner", true).unwrap();

        if let Some(batch) = store.read_batch(RecordClass::Event, "owner", 100, true) {
            prop_assert!(batch.records.iter().all(|r| r.id > cutoff));
        }

        let removed_again = store
            .delete_up_to(RecordClass::Event, cutoff, "owner", true)
            .unwrap();
        prop_assert_eq!(removed_again, 0);
    }

    /// Cutoff deletion never touches another owner's records.
    #[test]
    fn prop_cutoff_deletion_isolated_per_owner(picks in proptest::collection::vec(any::<bool>(), 1..30)) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut beta_count = 0u64;
        for (i, alpha) in picks.iter().enumerate() {
            let owner = if *alpha { "alpha" } else { "beta" };
            if !*alpha {
                beta_count += 1;
            }
            store
                .insert(RecordClass::Event, b"{}", owner, false, Timestamp(i as i64))
                .unwrap();
        }

        if let Some(batch) = store.read_batch(RecordClass::Event, "alpha", 100, true) {
            store
                .delete_up_to(RecordClass::Event, batch.cutoff, "alpha", true)
                .unwrap();
        }

        prop_assert_eq!(store.count_for_owner(RecordClass::Event, "alpha"), 0);
        prop_assert_eq!(store.count_for_owner(RecordClass::Event, "beta"), beta_count);
    }
}

#[test]
fn test_admission_denied_under_storage_floor_never_grows_store() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::open(&PipelineConfig {
        storage_path: dir.path().join("queue"),
        minimum_free_space_bytes: u64::MAX,
        ..Default::default()
    })
    .unwrap();

    for i in 0..5 {
        let outcome = store
            .insert(RecordClass::Event, b"{}", "owner", false, Timestamp(i))
            .unwrap();
        assert_eq!(outcome, InsertOutcome::AdmissionDenied);
        assert_eq!(store.total_size_bytes(), 0);
    }
}
