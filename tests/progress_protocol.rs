use daxprogress::journal::Journal;
use daxprogress::level::level_for_xp;
use daxprogress::model::ProgressDelta;
use daxprogress::progress::{ProgressUpdater, WriteMode, USERS_TABLE};
use daxprogress::remote::memory::MemoryStore;
use daxprogress::Error;
use serde_json::json;
use std::sync::Arc;

const MODES: [WriteMode; 3] = [
    WriteMode::ReadModifyWrite,
    WriteMode::CompareAndSwap,
    WriteMode::AtomicIncrement,
];

fn seeded_store(xp: u64, coins: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.seed(
        USERS_TABLE,
        json!({
            "id": "player-1",
            "username": "ana",
            "email": "ana@example.com",
            "xp": xp,
            "coins": coins,
            "level": level_for_xp(xp),
            "streak_days": 4,
            "is_premium": true,
        }),
    );
    store
}

#[test]
fn test_sequential_deltas_accumulate_in_every_mode() {
    for mode in MODES {
        let store = seeded_store(0, 0);
        let updater = ProgressUpdater::new(Arc::clone(&store)).with_mode(mode);

        let mut last_xp = 0;
        for _ in 0..12 {
            let user = updater
                .apply_xp_delta("player-1", ProgressDelta::new(100, 10))
                .unwrap();
            assert!(user.xp > last_xp, "{:?}: xp must grow", mode);
            assert!(user.level_is_consistent(), "{:?}: level drifted", mode);
            last_xp = user.xp;
        }

        let row = store.peek(USERS_TABLE, "player-1").unwrap();
        assert_eq!(row["xp"], 1200, "{:?}", mode);
        assert_eq!(row["coins"], 120, "{:?}", mode);
        assert_eq!(row["level"], 2, "{:?}", mode);
    }
}

#[test]
fn test_crossing_a_level_boundary() {
    for mode in MODES {
        let store = seeded_store(950, 5);
        let updater = ProgressUpdater::new(Arc::clone(&store)).with_mode(mode);
        let user = updater
            .apply_xp_delta("player-1", ProgressDelta::xp(2100))
            .unwrap();
        assert_eq!(user.xp, 3050, "{:?}", mode);
        assert_eq!(user.level, 4, "{:?}", mode);
        assert_eq!(user.coins, 5, "{:?}", mode);
    }
}

#[test]
fn test_missing_user_writes_nothing() {
    for mode in MODES {
        let store = seeded_store(0, 0);
        let updater = ProgressUpdater::new(Arc::clone(&store)).with_mode(mode);
        let before = store.stats();

        let err = updater
            .apply_xp_delta("ghost", ProgressDelta::new(100, 10))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(ref id) if id == "ghost"), "{:?}", mode);
        assert_eq!(store.peek(USERS_TABLE, "ghost"), None);
        assert_eq!(store.peek(USERS_TABLE, "player-1").unwrap()["xp"], 0);
        if mode != WriteMode::AtomicIncrement {
            assert_eq!(store.stats().writes(), before.writes(), "{:?}", mode);
        }
    }
}

#[test]
fn test_sparse_row_updates_in_every_mode() {
    for mode in MODES {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            USERS_TABLE,
            json!({"id": "u1", "username": "a", "email": "a@b.co", "xp": 0}),
        );
        let updater = ProgressUpdater::new(Arc::clone(&store)).with_mode(mode);

        let user = updater
            .apply_xp_delta("u1", ProgressDelta::new(100, 5))
            .unwrap_or_else(|e| panic!("{:?}: {:?}", mode, e));
        assert_eq!(user.xp, 100, "{:?}", mode);
        assert_eq!(user.coins, 5, "{:?}", mode);
        assert_eq!(store.peek(USERS_TABLE, "u1").unwrap()["coins"], 5, "{:?}", mode);
    }
}

#[test]
fn test_returned_record_reflects_stored_row() {
    let store = seeded_store(40, 2);
    let updater = ProgressUpdater::new(Arc::clone(&store));
    let user = updater
        .apply_xp_delta("player-1", ProgressDelta::new(60, 3))
        .unwrap();

    assert_eq!(user.streak_days, 4);
    assert!(user.is_premium);
    assert_eq!(user.username, "ana");
    let row = store.peek(USERS_TABLE, "player-1").unwrap();
    assert_eq!(row["xp"], user.xp);
    assert_eq!(row["coins"], user.coins);
}

fn race_two_awards(mode: WriteMode, stage_reads: bool) -> u64 {
    let store = seeded_store(0, 0);
    let updater = ProgressUpdater::new(Arc::clone(&store)).with_mode(mode);
    if stage_reads {
        store.stage_concurrent_reads(2);
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| scope.spawn(|| updater.apply_xp_delta("player-1", ProgressDelta::xp(100))))
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    });

    store.peek(USERS_TABLE, "player-1").unwrap()["xp"]
        .as_u64()
        .unwrap()
}

#[test]
fn test_read_modify_write_loses_an_interleaved_update() {
    assert_eq!(race_two_awards(WriteMode::ReadModifyWrite, true), 100);
}

#[test]
fn test_compare_and_swap_keeps_both_updates() {
    assert_eq!(race_two_awards(WriteMode::CompareAndSwap, true), 200);
}

#[test]
fn test_atomic_increment_keeps_both_updates() {
    assert_eq!(race_two_awards(WriteMode::AtomicIncrement, false), 200);
}

#[test]
fn test_compare_and_swap_journals_the_conflict() {
    let store = seeded_store(0, 0);
    let (journal, buffer) = Journal::in_memory("race");
    let updater = ProgressUpdater::new(Arc::clone(&store))
        .with_mode(WriteMode::CompareAndSwap)
        .with_journal(Arc::new(journal));
    store.stage_concurrent_reads(2);

    std::thread::scope(|scope| {
        let a = scope.spawn(|| updater.apply_xp_delta("player-1", ProgressDelta::xp(100)));
        let b = scope.spawn(|| updater.apply_xp_delta("player-1", ProgressDelta::xp(100)));
        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();
    });

    let types = buffer.types();
    assert_eq!(types.iter().filter(|t| *t == "write_conflict").count(), 1);
    assert_eq!(types.iter().filter(|t| *t == "progress_written").count(), 2);
    assert_eq!(types.iter().filter(|t| *t == "outcome").count(), 2);
}

#[test]
fn test_outage_surfaces_without_retry() {
    let store = seeded_store(0, 0);
    store.set_unavailable(true);
    let updater = ProgressUpdater::new(Arc::clone(&store)).with_mode(WriteMode::CompareAndSwap);

    let err = updater
        .apply_xp_delta("player-1", ProgressDelta::xp(100))
        .unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
    assert!(err.is_transient());
    assert_eq!(store.stats().gets, 1);
}
