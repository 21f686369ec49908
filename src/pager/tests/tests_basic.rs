#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::env::{Env, EnvFile, PosixEnv};
    use crate::pager::{DATA_OFFSET, Pager, PagerError};

    const PAGE: usize = 1024;
    const BLOCK: usize = 4 * PAGE;

    fn open_pager(tmp: &TempDir) -> Pager {
        let file = PosixEnv
            .open_file(&tmp.path().join("db"), true)
            .unwrap();
        Pager::new(file, PAGE, BLOCK).unwrap()
    }

    #[test]
    fn test_geometry_validation() {
        let tmp = TempDir::new().unwrap();
        let file = PosixEnv.open_file(&tmp.path().join("db"), true).unwrap();
        assert!(matches!(
            Pager::new(Arc::clone(&file), 100, 4096),
            Err(PagerError::Geometry(_))
        ));
        assert!(matches!(
            Pager::new(file, 1024, 1500),
            Err(PagerError::Geometry(_))
        ));
    }

    #[test]
    fn test_page_block_arithmetic() {
        let tmp = TempDir::new().unwrap();
        let pager = open_pager(&tmp);

        assert_eq!(pager.pages_per_block(), 4);
        assert_eq!(pager.page_offset(1), DATA_OFFSET);
        assert_eq!(pager.page_offset(2), DATA_OFFSET + PAGE as u64);

        assert_eq!(pager.block_of_page(1), 1);
        assert_eq!(pager.block_of_page(4), 1);
        assert_eq!(pager.block_of_page(5), 2);
        assert_eq!(pager.first_page_of_block(2), 5);
        assert_eq!(pager.last_page_of_block(2), 8);
    }

    #[test]
    fn test_page_round_trip() {
        let tmp = TempDir::new().unwrap();
        let pager = open_pager(&tmp);
        pager.extend_to_blocks(1).unwrap();

        let mut page = vec![0u8; PAGE];
        page[0] = 0xAB;
        page[100] = 0xCD;
        pager.write_page(3, &mut page).unwrap();

        let read = pager.read_page(3).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[100], 0xCD);
        assert_eq!(pager.pages_written(), 1);
        assert_eq!(pager.pages_read(), 1);
    }

    #[test]
    fn test_corrupt_page_detected() {
        let tmp = TempDir::new().unwrap();
        let pager = open_pager(&tmp);
        pager.extend_to_blocks(1).unwrap();

        let mut page = vec![0x11u8; PAGE];
        pager.write_page(2, &mut page).unwrap();

        // Flip a payload byte behind the pager's back.
        let file = PosixEnv.open_file(&tmp.path().join("db"), false).unwrap();
        file.write_at(pager.page_offset(2) + 7, &[0x99]).unwrap();
        pager.refresh_map().unwrap();

        assert!(matches!(pager.read_page(2), Err(PagerError::Corrupt(2))));
    }

    #[test]
    fn test_unwritten_page_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let pager = open_pager(&tmp);
        pager.extend_to_blocks(1).unwrap();
        // All-zero page: checksum of zeroes does not match the zero word.
        assert!(matches!(pager.read_page(1), Err(PagerError::Corrupt(1))));
    }

    #[test]
    fn test_meta_slots_are_independent() {
        let tmp = TempDir::new().unwrap();
        let pager = open_pager(&tmp);

        pager.write_meta(1, b"slot-one").unwrap();
        pager.write_meta(2, b"slot-two").unwrap();

        let m1 = pager.read_meta(1).unwrap();
        let m2 = pager.read_meta(2).unwrap();
        assert_eq!(&m1[..8], b"slot-one");
        assert_eq!(&m2[..8], b"slot-two");
        // Padding is zeroed.
        assert!(m1[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_past_map_after_growth() {
        let tmp = TempDir::new().unwrap();
        let pager = open_pager(&tmp);
        pager.extend_to_blocks(1).unwrap();

        let mut page = vec![0x42u8; PAGE];
        pager.write_page(4, &mut page).unwrap();
        assert_eq!(pager.read_page(4).unwrap()[10], 0x42);

        // Grow by a block and write into it; the refreshed map must
        // cover the new range.
        pager.extend_to_blocks(2).unwrap();
        let mut page2 = vec![0x43u8; PAGE];
        pager.write_page(8, &mut page2).unwrap();
        assert_eq!(pager.read_page(8).unwrap()[10], 0x43);
    }
}
