#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::db::tests::helpers::{manual_config, open};

    fn ladder_key(iter: u32, level: u32, i: u32) -> Vec<u8> {
        format!("it{iter:03}-lv{level}-{i:03}").into_bytes()
    }

    #[test]
    fn test_rollback_restores_state_at_begin() {
        let tmp = TempDir::new().unwrap();
        let db = open(&tmp.path().join("db"), manual_config());

        db.write(b"stable", b"before").unwrap();

        db.begin(1).unwrap();
        db.write(b"stable", b"inside").unwrap();
        db.write(b"fresh", b"inside").unwrap();
        db.rollback(0).unwrap();

        assert_eq!(db.get(b"stable").unwrap(), Some(b"before".to_vec()));
        assert_eq!(db.get(b"fresh").unwrap(), None);
    }

    #[test]
    fn test_commit_outermost_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");
        let db = open(&path, manual_config());

        db.begin(1).unwrap();
        db.write(b"a", b"1").unwrap();
        db.write(b"b", b"2").unwrap();
        db.commit(0).unwrap();
        drop(db); // no close: recovery must replay the commit

        let db = open(&path, manual_config());
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_nested_rollback_peels_one_level() {
        let tmp = TempDir::new().unwrap();
        let db = open(&tmp.path().join("db"), manual_config());

        db.begin(1).unwrap();
        db.write(b"depth", b"1").unwrap();
        db.begin(2).unwrap();
        db.write(b"depth", b"2").unwrap();
        db.begin(3).unwrap();
        db.write(b"depth", b"3").unwrap();

        // Roll back to the state at begin(3); levels 1-2 stay intact.
        db.rollback(3).unwrap();
        assert_eq!(db.get(b"depth").unwrap(), Some(b"2".to_vec()));

        db.rollback(2).unwrap();
        assert_eq!(db.get(b"depth").unwrap(), Some(b"1".to_vec()));

        // The rolled-back level is still open: writes at it work and
        // commit with the rest.
        db.write(b"depth", b"2b").unwrap();
        db.commit(0).unwrap();
        assert_eq!(db.get(b"depth").unwrap(), Some(b"2b".to_vec()));
    }

    #[test]
    fn test_inner_commit_folds_into_outer() {
        let tmp = TempDir::new().unwrap();
        let db = open(&tmp.path().join("db"), manual_config());

        db.begin(1).unwrap();
        db.begin(2).unwrap();
        db.write(b"x", b"inner").unwrap();
        db.commit(1).unwrap();

        // The inner commit is not durable on its own: rolling back the
        // outer transaction takes the inner write with it.
        db.rollback(0).unwrap();
        assert_eq!(db.get(b"x").unwrap(), None);
    }

    #[test]
    fn test_commit_above_depth_is_noop() {
        let tmp = TempDir::new().unwrap();
        let db = open(&tmp.path().join("db"), manual_config());

        db.begin(2).unwrap();
        db.write(b"k", b"v").unwrap();
        db.commit(5).unwrap(); // deeper than open: tolerated
        db.rollback(0).unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);

        // Same for rollback above depth.
        db.rollback(7).unwrap();
    }

    #[test]
    fn test_begin_is_idempotent_at_depth() {
        let tmp = TempDir::new().unwrap();
        let db = open(&tmp.path().join("db"), manual_config());

        db.begin(2).unwrap();
        db.write(b"k", b"v1").unwrap();
        db.begin(2).unwrap(); // already at depth 2: no new frame
        db.begin(1).unwrap(); // below depth: no-op
        db.rollback(2).unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_savepoint_ladder() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");
        let db = open(&path, manual_config());

        const ITERS: u32 = 20;
        const PER_LEVEL: u32 = 10;

        for iter in 0..ITERS {
            db.begin(1).unwrap();
            for level in 1..=5u32 {
                db.begin(level as usize).unwrap();
                for i in 0..PER_LEVEL {
                    db.write(&ladder_key(iter, level, i), b"v").unwrap();
                }
            }

            // Unwind levels 5..2 one at a time, checking that each
            // rollback removes exactly that level's keys.
            for level in (2..=5u32).rev() {
                db.rollback(level as usize).unwrap();
                assert_eq!(
                    db.get(&ladder_key(iter, level, 0)).unwrap(),
                    None,
                    "iter {iter} level {level} should be rolled back"
                );
                if level > 2 {
                    assert!(
                        db.get(&ladder_key(iter, level - 1, 0)).unwrap().is_some(),
                        "iter {iter} level {} should survive",
                        level - 1
                    );
                }
            }

            // Level-1 keys remain; keep them on even iterations only.
            assert!(db.get(&ladder_key(iter, 1, 0)).unwrap().is_some());
            if iter % 2 == 0 {
                db.commit(0).unwrap();
            } else {
                db.rollback(0).unwrap();
            }
        }

        // Survivors: level-1 keys of even iterations, nothing else.
        db.close().unwrap();
        drop(db);
        let db = open(&path, manual_config());
        for iter in 0..ITERS {
            for level in 1..=5u32 {
                for i in 0..PER_LEVEL {
                    let expect = level == 1 && iter % 2 == 0;
                    assert_eq!(
                        db.get(&ladder_key(iter, level, i)).unwrap().is_some(),
                        expect,
                        "iter {iter} level {level} i {i}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_cursor_sees_own_uncommitted_writes() {
        let tmp = TempDir::new().unwrap();
        let db = open(&tmp.path().join("db"), manual_config());

        db.begin(1).unwrap();
        db.write(b"pending", b"v").unwrap();
        assert_eq!(db.get(b"pending").unwrap(), Some(b"v".to_vec()));
        db.rollback(0).unwrap();
    }
}
