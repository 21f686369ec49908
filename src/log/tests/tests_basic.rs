#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::env::{Env, EnvFile, PosixEnv};
    use crate::log::{Log, LogPtr, LogReader, LogRecord};

    fn open_log(tmp: &TempDir, log_size: u64) -> (Log, Arc<dyn EnvFile>) {
        let file = PosixEnv.open_file(&tmp.path().join("log"), true).unwrap();
        let log = Log::open(Arc::clone(&file), LogPtr::default(), 0, log_size);
        (log, file)
    }

    fn replay_all(file: &Arc<dyn EnvFile>, ptr: LogPtr) -> Vec<LogRecord> {
        let mut reader = LogReader::new(Arc::clone(file), ptr);
        let mut out = Vec::new();
        while let Some((record, _)) = reader.next_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = TempDir::new().unwrap();
        let (mut log, file) = open_log(&tmp, 1 << 20);

        let records = vec![
            LogRecord::Write {
                key: b"a".to_vec(),
                value: b"v1".to_vec(),
            },
            LogRecord::Delete { key: b"b".to_vec() },
            LogRecord::Commit,
        ];
        for r in &records {
            log.append(r).unwrap();
        }
        log.sync().unwrap();

        assert_eq!(replay_all(&file, LogPtr::default()), records);
    }

    #[test]
    fn test_replay_from_mid_pointer() {
        let tmp = TempDir::new().unwrap();
        let (mut log, file) = open_log(&tmp, 1 << 20);

        log.append(&LogRecord::Write {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        })
        .unwrap();
        let mid = log
            .append(&LogRecord::Commit)
            .unwrap();
        log.append(&LogRecord::Write {
            key: b"b".to_vec(),
            value: b"2".to_vec(),
        })
        .unwrap();

        // Replay from the mid pointer sees only the suffix.
        let replayed = replay_all(&file, mid);
        assert_eq!(
            replayed,
            vec![LogRecord::Write {
                key: b"b".to_vec(),
                value: b"2".to_vec(),
            }]
        );
    }

    #[test]
    fn test_truncate_discards_suffix() {
        let tmp = TempDir::new().unwrap();
        let (mut log, file) = open_log(&tmp, 1 << 20);

        log.append(&LogRecord::Write {
            key: b"keep".to_vec(),
            value: b"1".to_vec(),
        })
        .unwrap();
        let saved = log.tell();
        log.append(&LogRecord::Write {
            key: b"drop".to_vec(),
            value: b"2".to_vec(),
        })
        .unwrap();

        log.truncate_to(saved).unwrap();

        let replayed = replay_all(&file, LogPtr::default());
        assert_eq!(replayed.len(), 1);
        assert_eq!(
            replayed[0],
            LogRecord::Write {
                key: b"keep".to_vec(),
                value: b"1".to_vec(),
            }
        );

        // Appends after the rollback chain correctly from the saved
        // position.
        log.append(&LogRecord::Write {
            key: b"next".to_vec(),
            value: b"3".to_vec(),
        })
        .unwrap();
        let replayed = replay_all(&file, LogPtr::default());
        assert_eq!(replayed.len(), 2);
        assert_eq!(
            replayed[1],
            LogRecord::Write {
                key: b"next".to_vec(),
                value: b"3".to_vec(),
            }
        );
    }

    #[test]
    fn test_corrupted_frame_ends_replay() {
        let tmp = TempDir::new().unwrap();
        let (mut log, file) = open_log(&tmp, 1 << 20);

        for i in 0..3u8 {
            log.append(&LogRecord::Write {
                key: vec![i],
                value: vec![i, i],
            })
            .unwrap();
        }
        let end = log.tell();

        // Corrupt a byte inside the last frame.
        file.write_at(end.offset - 3, &[0xFF]).unwrap();

        let replayed = replay_all(&file, LogPtr::default());
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn test_truncated_tail_ends_replay() {
        let tmp = TempDir::new().unwrap();
        let (mut log, file) = open_log(&tmp, 1 << 20);

        log.append(&LogRecord::Write {
            key: b"whole".to_vec(),
            value: b"1".to_vec(),
        })
        .unwrap();
        log.append(&LogRecord::Write {
            key: b"torn".to_vec(),
            value: b"2".to_vec(),
        })
        .unwrap();

        // Chop the last few bytes as a torn write would.
        let len = file.len().unwrap();
        file.truncate(len - 4).unwrap();

        let replayed = replay_all(&file, LogPtr::default());
        assert_eq!(replayed.len(), 1);
    }
}
