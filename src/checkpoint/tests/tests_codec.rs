#[cfg(test)]
mod tests {
    use rand::Rng;

    use crate::checkpoint::{
        self, CKPT_MAX_WORDS, FreeDecoded, FreePayload, decode, encode, overflow_plan, peek_id,
    };
    use crate::log::LogPtr;
    use crate::snapshot::{FreeBlock, Level, MergeInput, MergeState, SegmentRecord, Snapshot};

    fn seg(first: u32) -> SegmentRecord {
        SegmentRecord {
            first_pg: first,
            last_pg: first + 9,
            root_pg: first + 10,
            n_pages: 11,
        }
    }

    fn sample_snapshot() -> Snapshot {
        let mut snap = Snapshot::initial(4096, 1 << 20);
        snap.ckpt_id = 7;
        snap.n_block = 42;
        snap.log_ptr = LogPtr {
            offset: 0x1_2345_6789,
            cksum: [0xAAAA_0001, 0xBBBB_0002],
        };
        snap.levels.push(Level::stable(0, seg(100)));
        snap.levels.push(Level {
            age: 1,
            lhs: seg(200),
            rhs: vec![seg(300), seg(400)],
            merge: Some(MergeState {
                inputs: vec![
                    MergeInput { pgno: 301, cell: 5 },
                    MergeInput { pgno: 401, cell: 9 },
                ],
                n_skip: 1,
                split_pg: 205,
                split_cell: 3,
            }),
        });
        snap.free = vec![
            FreeBlock {
                block: 9,
                freed_at: 3,
            },
            FreeBlock {
                block: 12,
                freed_at: 5,
            },
        ];
        snap
    }

    fn assert_levels_eq(a: &[Level], b: &[Level]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert_eq!(x.age, y.age);
            assert_eq!(x.lhs, y.lhs);
            assert_eq!(x.rhs, y.rhs);
            assert_eq!(x.merge, y.merge);
        }
    }

    #[test]
    fn test_round_trip_full_freelist() {
        let snap = sample_snapshot();
        let blob = encode(&snap, snap.levels.len(), FreePayload::Full(&snap.free)).unwrap();
        assert_eq!(blob.len() % 4, 0);

        let decoded = decode(&blob).unwrap().expect("valid checkpoint");
        assert_eq!(decoded.ckpt_id, 7);
        assert_eq!(decoded.n_block, 42);
        assert_eq!(decoded.page_size, 4096);
        assert_eq!(decoded.block_size, 1 << 20);
        assert_eq!(decoded.log_ptr, snap.log_ptr);
        assert!(!decoded.ovfl);
        assert_eq!(decoded.free, FreeDecoded::Full(vec![9, 12]));
        assert_levels_eq(&decoded.inline_levels, &snap.levels);
    }

    #[test]
    fn test_round_trip_delta_freelist() {
        let snap = sample_snapshot();
        let blob = encode(&snap, 1, FreePayload::Delta([4, 77, 0])).unwrap();

        let decoded = decode(&blob).unwrap().expect("valid checkpoint");
        assert!(decoded.ovfl);
        assert_eq!(decoded.inline_levels.len(), 1);
        assert_eq!(
            decoded.free,
            FreeDecoded::Delta {
                keep: 4,
                refree: [77, 0],
            }
        );
    }

    #[test]
    fn test_peek_id_matches() {
        let snap = sample_snapshot();
        let blob = encode(&snap, snap.levels.len(), FreePayload::Full(&snap.free)).unwrap();
        assert_eq!(peek_id(&blob), Some(7));
    }

    #[test]
    fn test_blank_slot_decodes_to_none() {
        assert!(decode(&[0u8; 4096]).unwrap().is_none());
        assert!(decode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_corruption_decodes_to_none() {
        let snap = sample_snapshot();
        let blob = encode(&snap, snap.levels.len(), FreePayload::Full(&snap.free)).unwrap();
        for at in [0usize, 8, blob.len() / 2, blob.len() - 1] {
            let mut bad = blob.clone();
            bad[at] ^= 0x40;
            assert!(
                decode(&bad).unwrap().is_none(),
                "flip at {at} should invalidate"
            );
        }
    }

    #[test]
    fn test_oversized_encode_rejected() {
        let mut snap = sample_snapshot();
        snap.free = (0..2000)
            .map(|i| FreeBlock {
                block: i,
                freed_at: 0,
            })
            .collect();
        assert!(encode(&snap, snap.levels.len(), FreePayload::Full(&snap.free)).is_err());
    }

    #[test]
    fn test_overflow_plan_small_snapshot_fits() {
        let snap = sample_snapshot();
        let plan = overflow_plan(&snap);
        assert_eq!(plan.inline_levels, snap.levels.len());
        assert!(!plan.ovfl);
    }

    #[test]
    fn test_overflow_plan_many_levels_spills_tail() {
        let mut snap = sample_snapshot();
        snap.levels = (0..300)
            .map(|i| Level::stable(i, seg(100 + i * 20)))
            .collect();
        let plan = overflow_plan(&snap);
        assert!(plan.ovfl);
        assert!(plan.inline_levels < snap.levels.len());
        assert!(plan.inline_levels > 0);

        // The inline prefix plus reserves must actually fit.
        let blob = encode(&snap, plan.inline_levels, FreePayload::Delta([0, 0, 0])).unwrap();
        assert!(blob.len() <= CKPT_MAX_WORDS * 4);
    }

    #[test]
    fn test_overflow_plan_is_order_sensitive() {
        // A free list that alone would fit must still overflow when
        // levels have consumed the page first.
        let mut snap = sample_snapshot();
        snap.levels = (0..150)
            .map(|i| Level::stable(i, seg(100 + i * 20)))
            .collect();
        snap.free = (0..200)
            .map(|i| FreeBlock {
                block: i,
                freed_at: 0,
            })
            .collect();
        let plan = overflow_plan(&snap);
        assert!(plan.ovfl);
    }

    #[test]
    fn test_levels_record_round_trip() {
        let snap = sample_snapshot();
        let bytes = checkpoint::encode_levels_record(&snap.levels);
        let levels = checkpoint::decode_levels_record(&bytes).unwrap();
        assert_levels_eq(&levels, &snap.levels);
    }

    #[test]
    fn test_free_record_round_trip() {
        let list = vec![
            FreeBlock {
                block: 3,
                freed_at: 0,
            },
            FreeBlock {
                block: 8,
                freed_at: 0,
            },
        ];
        let bytes = checkpoint::encode_free_record(&list);
        assert_eq!(checkpoint::decode_free_record(&bytes).unwrap(), vec![3, 8]);
    }

    #[test]
    fn test_chunking_round_trip() {
        for len in [0usize, 1, 100, 430, 431, 5000] {
            let blob: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let chunks = checkpoint::chunk_blob(&blob, 430);

            let (count, head) = checkpoint::chunk_head(&chunks[0]).unwrap();
            assert_eq!(count as usize, chunks.len(), "len {len}");

            let mut rebuilt = head.to_vec();
            for chunk in &chunks[1..] {
                rebuilt.extend_from_slice(chunk);
            }
            assert_eq!(rebuilt, blob, "len {len}");

            // Every chunk fits the budget.
            for chunk in &chunks {
                assert!(chunk.len() <= 430);
            }
        }
    }

    #[test]
    fn test_chunk_keys_are_ordered_and_distinct() {
        let k0 = checkpoint::sys_chunk_key(checkpoint::SYS_FREELIST_KEY, 0);
        let k1 = checkpoint::sys_chunk_key(checkpoint::SYS_FREELIST_KEY, 1);
        let l0 = checkpoint::sys_chunk_key(checkpoint::SYS_LEVELS_KEY, 0);
        assert!(k0 < k1);
        // Every FREELIST chunk orders before every LEVELS chunk.
        assert!(k1 < l0);
    }

    #[test]
    fn test_random_snapshots_round_trip() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let mut snap = Snapshot::initial(4096, 1 << 20);
            snap.ckpt_id = rng.random();
            snap.n_block = rng.random_range(0..10_000);
            snap.log_ptr = LogPtr {
                offset: rng.random(),
                cksum: [rng.random(), rng.random()],
            };
            for age in 0..rng.random_range(0..8u32) {
                let n_rhs = rng.random_range(0..4usize);
                let rhs: Vec<_> = (0..n_rhs)
                    .map(|i| seg(rng.random_range(1..100_000) + i as u32))
                    .collect();
                let merge = (n_rhs > 0).then(|| MergeState {
                    inputs: (0..n_rhs)
                        .map(|_| MergeInput {
                            pgno: rng.random_range(0..100_000),
                            cell: rng.random_range(0..64),
                        })
                        .collect(),
                    n_skip: rng.random_range(0..4),
                    split_pg: rng.random_range(0..100_000),
                    split_cell: rng.random_range(0..64),
                });
                snap.levels.push(Level {
                    age,
                    lhs: seg(rng.random_range(1..100_000)),
                    rhs,
                    merge,
                });
            }
            let n_free = rng.random_range(0..16usize);
            snap.free = (0..n_free)
                .map(|_| FreeBlock {
                    block: rng.random_range(1..100_000),
                    freed_at: 0,
                })
                .collect();

            let blob =
                encode(&snap, snap.levels.len(), FreePayload::Full(&snap.free)).unwrap();
            let decoded = decode(&blob).unwrap().expect("valid checkpoint");
            assert_eq!(decoded.ckpt_id, snap.ckpt_id);
            assert_eq!(decoded.log_ptr, snap.log_ptr);
            assert_levels_eq(&decoded.inline_levels, &snap.levels);
        }
    }
}
