#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::cursor::{Cursor, SeekMode};
    use crate::pager::Pager;
    use crate::segment::tests::helpers::{SeqAlloc, small_pager};
    use crate::segment::{Record, SegmentWriter};
    use crate::snapshot::{Level, Snapshot};
    use crate::tree::Tree;

    /// Build a snapshot of two levels plus a tree view:
    ///
    /// - old level:  keys 0..100 step 2 → "old"
    /// - young level: keys 0..100 step 4 → "young", key 44 tombstoned
    /// - tree:       keys 0..100 step 8 → "tree", key 8 tombstoned
    fn fixture(tmp: &TempDir) -> (Arc<Pager>, Arc<Snapshot>, Cursor) {
        let pager = small_pager(tmp);
        let mut alloc = SeqAlloc::new(pager.clone());

        let key = |i: u32| format!("key-{i:03}").into_bytes();

        let mut writer = SegmentWriter::new(&pager, &mut alloc);
        for i in (0..100).step_by(2) {
            writer.push(&Record::write(key(i), b"old".to_vec())).unwrap();
        }
        let old_seg = writer.finish(true).unwrap();

        let mut writer = SegmentWriter::new(&pager, &mut alloc);
        for i in (0..100).step_by(4) {
            if i == 44 {
                writer.push(&Record::tombstone(key(i))).unwrap();
            } else {
                writer.push(&Record::write(key(i), b"young".to_vec())).unwrap();
            }
        }
        let young_seg = writer.finish(true).unwrap();

        let mut snap = Snapshot::initial(512, 2048);
        snap.levels.push(Level::stable(0, young_seg));
        snap.levels.push(Level::stable(1, old_seg));
        let snap = Arc::new(snap);

        let mut tree = Tree::new();
        for i in (0..100).step_by(8) {
            if i == 8 {
                tree.delete(key(i));
            } else {
                tree.insert(key(i), b"tree".to_vec());
            }
        }
        let view = tree.freeze();

        let cursor = Cursor::new(pager.clone(), Arc::clone(&snap), view);
        (pager, snap, cursor)
    }

    fn expected_value(i: u32) -> Option<&'static str> {
        // Youngest source wins; tombstones at 8 (tree) and 44 (young
        // segment, not shadowed by the tree) hide the key entirely.
        if i % 8 == 0 {
            if i == 8 { None } else { Some("tree") }
        } else if i % 4 == 0 {
            if i == 44 { None } else { Some("young") }
        } else if i % 2 == 0 {
            Some("old")
        } else {
            None
        }
    }

    #[test]
    fn test_forward_scan_shadowing_and_tombstones() {
        let tmp = TempDir::new().unwrap();
        let (_pager, _snap, mut cursor) = fixture(&tmp);

        let mut seen = Vec::new();
        cursor.first().unwrap();
        while cursor.valid() {
            seen.push((
                cursor.key().unwrap().to_vec(),
                cursor.value().unwrap().to_vec(),
            ));
            cursor.next().unwrap();
        }

        let mut expect = Vec::new();
        for i in (0..100).step_by(2) {
            if let Some(v) = expected_value(i) {
                expect.push((format!("key-{i:03}").into_bytes(), v.as_bytes().to_vec()));
            }
        }
        assert_eq!(seen, expect);
    }

    #[test]
    fn test_backward_scan_matches_forward() {
        let tmp = TempDir::new().unwrap();
        let (_pager, _snap, mut cursor) = fixture(&tmp);

        let mut forward = Vec::new();
        cursor.first().unwrap();
        while cursor.valid() {
            forward.push(cursor.key().unwrap().to_vec());
            cursor.next().unwrap();
        }

        let mut backward = Vec::new();
        cursor.last().unwrap();
        while cursor.valid() {
            backward.push(cursor.key().unwrap().to_vec());
            cursor.prev().unwrap();
        }
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_seek_modes() {
        let tmp = TempDir::new().unwrap();
        let (_pager, _snap, mut cursor) = fixture(&tmp);

        // EQ hit.
        cursor.seek(b"key-016", SeekMode::Eq).unwrap();
        assert!(cursor.valid());
        assert_eq!(cursor.value().unwrap(), b"tree");

        // EQ on a tombstoned key misses.
        cursor.seek(b"key-008", SeekMode::Eq).unwrap();
        assert!(!cursor.valid());

        // EQ on a key that never existed misses.
        cursor.seek(b"key-001", SeekMode::Eq).unwrap();
        assert!(!cursor.valid());

        // GE rounds up past the tombstoned 44.
        cursor.seek(b"key-043", SeekMode::Ge).unwrap();
        assert_eq!(cursor.key().unwrap(), b"key-046");

        // LE rounds down past the tombstoned 44.
        cursor.seek(b"key-045", SeekMode::Le).unwrap();
        assert_eq!(cursor.key().unwrap(), b"key-042");
    }

    #[test]
    fn test_direction_switch() {
        let tmp = TempDir::new().unwrap();
        let (_pager, _snap, mut cursor) = fixture(&tmp);

        cursor.seek(b"key-020", SeekMode::Ge).unwrap();
        assert_eq!(cursor.key().unwrap(), b"key-020");
        cursor.next().unwrap();
        assert_eq!(cursor.key().unwrap(), b"key-022");
        cursor.prev().unwrap();
        assert_eq!(cursor.key().unwrap(), b"key-020");
        cursor.prev().unwrap();
        assert_eq!(cursor.key().unwrap(), b"key-018");
        cursor.next().unwrap();
        assert_eq!(cursor.key().unwrap(), b"key-020");
    }

    #[test]
    fn test_cursor_does_not_see_later_tree_writes() {
        let tmp = TempDir::new().unwrap();
        let pager = small_pager(&tmp);

        let mut tree = Tree::new();
        tree.insert(b"a".to_vec(), b"1".to_vec());
        let view = tree.freeze();
        let snap = Arc::new(Snapshot::initial(512, 2048));

        let mut cursor = Cursor::new(pager, Arc::clone(&snap), view);

        // Writes after open are invisible to this cursor.
        tree.insert(b"b".to_vec(), b"2".to_vec());

        cursor.first().unwrap();
        assert_eq!(cursor.key().unwrap(), b"a");
        cursor.next().unwrap();
        assert!(!cursor.valid());
    }

    #[test]
    fn test_empty_database_cursor() {
        let tmp = TempDir::new().unwrap();
        let pager = small_pager(&tmp);
        let snap = Arc::new(Snapshot::initial(512, 2048));
        let mut tree = Tree::new();

        let mut cursor = Cursor::new(pager, snap, tree.freeze());
        cursor.first().unwrap();
        assert!(!cursor.valid());
        cursor.last().unwrap();
        assert!(!cursor.valid());
        cursor.seek(b"anything", SeekMode::Ge).unwrap();
        assert!(!cursor.valid());
    }
}
