#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::db::tests::helpers::{key, manual_config, open, value};
    use crate::db::{Db, ErrorCode, SafetyLevel, WorkFlags};
    use crate::env::{Env, EnvFile, FaultEnv, FaultState, PosixEnv};

    #[test]
    fn test_drop_without_close_recovers_from_log() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");

        let db = open(&path, manual_config());
        for i in 0..200 {
            db.write(&key(i), &value(i)).unwrap();
        }
        drop(db); // crash: no flush, no checkpoint

        let db = open(&path, manual_config());
        for i in 0..200 {
            assert_eq!(db.get(&key(i)).unwrap(), Some(value(i)), "key {i}");
        }
    }

    #[test]
    fn test_uncommitted_tail_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");

        let db = open(&path, manual_config());
        db.write(b"committed", b"yes").unwrap();
        db.begin(1).unwrap();
        db.write(b"uncommitted", b"no").unwrap();
        drop(db); // crash with the transaction still open

        let db = open(&path, manual_config());
        assert_eq!(db.get(b"committed").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(db.get(b"uncommitted").unwrap(), None);
    }

    #[test]
    fn test_safety_full_commit_is_durable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");

        let mut config = manual_config();
        config.safety = SafetyLevel::Full;
        let db = open(&path, config.clone());
        db.begin(1).unwrap();
        db.write(b"r", b"record").unwrap();
        db.commit(0).unwrap();
        drop(db);

        let db = open(&path, config);
        assert_eq!(db.get(b"r").unwrap(), Some(b"record".to_vec()));
    }

    #[test]
    fn test_recovery_after_flush_and_more_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");

        let db = open(&path, manual_config());
        for i in 0..100 {
            db.write(&key(i), &value(i)).unwrap();
        }
        db.work(WorkFlags::FLUSH | WorkFlags::CHECKPOINT, 0).unwrap();
        // These land only in the log.
        for i in 100..150 {
            db.write(&key(i), &value(i)).unwrap();
        }
        drop(db);

        let db = open(&path, manual_config());
        for i in 0..150 {
            assert_eq!(db.get(&key(i)).unwrap(), Some(value(i)), "key {i}");
        }
        // Replay starts at the checkpoint: only the post-flush writes
        // are in the tree.
        assert!(db.info().unwrap().tree_bytes > 0);
    }

    #[test]
    fn test_torn_log_tail_loses_only_the_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");

        let db = open(&path, manual_config());
        for i in 0..50 {
            db.write(&key(i), &value(i)).unwrap();
        }
        drop(db);

        // Chop bytes off the log as a torn final write would.
        let log_path = {
            let mut p = path.clone().into_os_string();
            p.push("-log");
            std::path::PathBuf::from(p)
        };
        let file = PosixEnv.open_file(&log_path, false).unwrap();
        let len = file.len().unwrap();
        file.truncate(len - 5).unwrap();

        let db = open(&path, manual_config());
        // The last commit is gone; everything before it survives.
        for i in 0..49 {
            assert_eq!(db.get(&key(i)).unwrap(), Some(value(i)), "key {i}");
        }
        assert_eq!(db.get(&key(49)).unwrap(), None);
    }

    #[test]
    fn test_injected_write_fault_surfaces_as_ioerr() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");

        let state = FaultState::new();
        let env: Arc<dyn Env> = Arc::new(FaultEnv::new(Arc::new(PosixEnv), Arc::clone(&state)));
        let db = Db::open_with(env, &path, manual_config()).unwrap();

        db.write(b"before", b"ok").unwrap();

        state.arm(0);
        let err = db.write(b"during", b"fails").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Ioerr);
        state.disarm();

        // The failed write never reached the tree; later writes work.
        assert_eq!(db.get(b"during").unwrap(), None);
        db.write(b"after", b"ok").unwrap();
        assert_eq!(db.get(b"after").unwrap(), Some(b"ok".to_vec()));
    }

    #[test]
    fn test_flush_fault_leaves_tree_intact() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");

        let state = FaultState::new();
        let env: Arc<dyn Env> = Arc::new(FaultEnv::new(Arc::new(PosixEnv), Arc::clone(&state)));
        let db = Db::open_with(env, &path, manual_config()).unwrap();

        for i in 0..50 {
            db.write(&key(i), &value(i)).unwrap();
        }

        // Let a few pages through, then fail mid-segment.
        state.arm(3);
        let err = db.work(WorkFlags::FLUSH, 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Ioerr);
        state.disarm();

        // Nothing was lost: the tree still serves all keys, and a
        // retried flush succeeds.
        for i in 0..50 {
            assert_eq!(db.get(&key(i)).unwrap(), Some(value(i)), "key {i}");
        }
        db.work(WorkFlags::FLUSH | WorkFlags::CHECKPOINT, 0).unwrap();
        for i in 0..50 {
            assert_eq!(db.get(&key(i)).unwrap(), Some(value(i)), "key {i}");
        }
    }
}
