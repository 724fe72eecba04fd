#[cfg(test)]
mod integration {
    use crate::error::Error;
    use crate::hdr::OBJ_LANES_OFFSET;
    use crate::lane::{LANE_SIZE, OBJ_NLANES};
    use crate::oid::LIST_HEAD_SIZE;
    use crate::utils;
    use crate::{alloc_usable_size, direct, free, next, ObjPool, Oid, NTYPES, OOB_OFFSET};
    use std::convert::TryInto;
    use std::fs;
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::{Path, PathBuf};

    const POOL_SIZE: usize = 8 * 1024 * 1024;
    const RUN_ID_OFF: u64 = 8192;
    const HDR_CSUM_OFF: u64 = 4088;

    fn pool_path(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("spinel_test_{}.pool", name));
        let _ = fs::remove_file(&p);
        p
    }

    fn patch(path: &Path, off: u64, bytes: &[u8]) {
        let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
        f.seek(SeekFrom::Start(off)).unwrap();
        f.write_all(bytes).unwrap();
        f.sync_all().unwrap();
    }

    fn read_at(path: &Path, off: u64, len: usize) -> Vec<u8> {
        let mut f = OpenOptions::new().read(true).open(path).unwrap();
        f.seek(SeekFrom::Start(off)).unwrap();
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf).unwrap();
        buf
    }

    fn payload(oid: Oid, len: usize) -> &'static [u8] {
        let p = direct(oid);
        assert!(!p.is_null());
        unsafe { std::slice::from_raw_parts(p, len) }
    }

    fn fill(pop: &ObjPool, oid: Oid, byte: u8, len: usize) {
        let p = direct(oid);
        assert!(!p.is_null());
        unsafe {
            std::ptr::write_bytes(p, byte, len);
        }
        pop.persist(oid, len);
    }

    #[test]
    fn create_close_open_roundtrip() {
        let path = pool_path("roundtrip");
        let pop = ObjPool::create(&path, Some("L"), POOL_SIZE, 0o600).unwrap();
        let uuid = pop.uuid_lo();
        let run1 = pop.run_id();
        assert_eq!(run1, 2);
        pop.close();

        let pop = ObjPool::open(&path, Some("L")).unwrap();
        assert_eq!(pop.uuid_lo(), uuid);
        assert_eq!(pop.run_id(), run1 + 2);
        assert!(pop.run_id() % 2 == 0 && pop.run_id() != 0);
        pop.close();

        // a third open keeps the pace
        let pop = ObjPool::open(&path, None).unwrap();
        assert_eq!(pop.run_id(), run1 + 4);
    }

    #[test]
    fn data_survives_reopen() {
        let path = pool_path("survive");
        let pop = ObjPool::create(&path, Some("L"), POOL_SIZE, 0o600).unwrap();
        let o = pop.alloc(16, 3).unwrap();
        fill(&pop, o, 0xC3, 16);
        pop.close();

        let pop = ObjPool::open(&path, Some("L")).unwrap();
        let first = pop.first(3).unwrap();
        assert_eq!(first, o);
        assert!(payload(first, 16).iter().all(|b| *b == 0xC3));
        drop(pop);
    }

    #[test]
    fn zalloc_zeroes_payload() {
        let path = pool_path("zalloc");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        let o = pop.zalloc(1024, 0).unwrap();
        assert!(payload(o, 1024).iter().all(|b| *b == 0));
        assert!(alloc_usable_size(o) >= 1024);
    }

    #[test]
    fn strdup_stores_exact_bytes() {
        let path = pool_path("strdup");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        let s = "persistent memory is byte addressable";
        let o = pop.strdup(s, 5).unwrap();
        assert_eq!(payload(o, s.len()), s.as_bytes());
        // allocator rounding may hand out more; never less
        assert!(alloc_usable_size(o) >= s.len());
    }

    #[test]
    fn usable_size_covers_request() {
        let path = pool_path("usable");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        for &size in &[1usize, 8, 55, 64, 100, 1000, 4096] {
            let o = pop.alloc(size, 1).unwrap();
            assert!(alloc_usable_size(o) >= size, "requested {}", size);
        }
    }

    #[test]
    fn realloc_moves_between_type_lists() {
        let path = pool_path("retype");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        let o = pop.alloc(64, 1).unwrap();
        let o2 = pop.realloc(o, 64, 2).unwrap();
        assert!(pop.first(1).unwrap().is_null());
        assert_eq!(pop.first(2).unwrap(), o2);
        assert!(next(o2).is_null());
    }

    #[test]
    fn zrealloc_zeroes_the_grown_suffix() {
        let path = pool_path("zrealloc");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        let o = pop.alloc(64, 9).unwrap();
        fill(&pop, o, 0xAA, 64);
        let old = alloc_usable_size(o);

        let grown = old + 100;
        let o2 = pop.zrealloc(o, grown, 9).unwrap();
        let buf = payload(o2, grown);
        assert!(buf[..64].iter().all(|b| *b == 0xAA));
        assert!(buf[old..grown].iter().all(|b| *b == 0));
        assert!(alloc_usable_size(o2) >= grown);
        assert_eq!(pop.first(9).unwrap(), o2);
    }

    #[test]
    fn root_grows_and_never_shrinks() {
        let path = pool_path("root");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        assert_eq!(pop.root_size(), 0);

        let r1 = pop.root(100).unwrap();
        assert_eq!(pop.root_size(), 100);
        assert_eq!(pop.root(100).unwrap(), r1);

        let r2 = pop.root(200).unwrap();
        assert_eq!(pop.root_size(), 200);

        // a smaller request neither shrinks nor moves the root
        assert_eq!(pop.root(50).unwrap(), r2);
        assert_eq!(pop.root_size(), 200);
        pop.close();

        let pop = ObjPool::open(&path, None).unwrap();
        assert_eq!(pop.root_size(), 200);
        assert_eq!(pop.root(10).unwrap(), r2);
    }

    #[test]
    fn type_number_is_validated() {
        let path = pool_path("types");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        assert!(matches!(
            pop.alloc(16, NTYPES),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            pop.first(NTYPES + 5),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            pop.realloc(pop.alloc(8, 0).unwrap(), 8, NTYPES),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn layout_is_enforced() {
        let path = pool_path("layout");
        let long = "x".repeat(crate::MAX_LAYOUT);
        assert!(matches!(
            ObjPool::create(&path, Some(long.as_str()), POOL_SIZE, 0o600),
            Err(Error::InvalidArgument(_))
        ));
        let _ = fs::remove_file(&path);

        let path = pool_path("layout2");
        ObjPool::create(&path, Some("L1"), POOL_SIZE, 0o600)
            .unwrap()
            .close();
        assert!(matches!(
            ObjPool::open(&path, Some("L2")),
            Err(Error::InvalidArgument(_))
        ));
        // the right name still opens
        ObjPool::open(&path, Some("L1")).unwrap();
    }

    #[test]
    fn corrupt_header_checksum_is_fatal() {
        let path = pool_path("badhdr");
        ObjPool::create(&path, Some("L"), POOL_SIZE, 0o600)
            .unwrap()
            .close();

        let b = read_at(&path, HDR_CSUM_OFF, 1);
        patch(&path, HDR_CSUM_OFF, &[b[0] ^ 0xFF]);

        assert!(matches!(
            ObjPool::open(&path, Some("L")),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn check_reports_consistent_pool() {
        let path = pool_path("checkok");
        let pop = ObjPool::create(&path, Some("L"), POOL_SIZE, 0o600).unwrap();
        pop.alloc(128, 2).unwrap();
        pop.close();
        assert!(ObjPool::check(&path, Some("L")).unwrap());
        // checking is read-only: the pool still opens writable afterwards
        ObjPool::open(&path, Some("L")).unwrap();
    }

    #[test]
    fn check_flags_odd_run_id() {
        let path = pool_path("oddrun");
        ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap().close();

        let mut rid = [0u8; 8];
        rid.copy_from_slice(&read_at(&path, RUN_ID_OFF, 8));
        let odd = u64::from_le_bytes(rid) | 1;
        patch(&path, RUN_ID_OFF, &odd.to_le_bytes());

        assert!(!ObjPool::check(&path, None).unwrap());
    }

    #[test]
    fn free_is_null_safe_and_unlinks() {
        let path = pool_path("free");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        free(Oid::NULL);

        let o = pop.alloc(32, 7).unwrap();
        assert_eq!(pop.first(7).unwrap(), o);
        free(o);
        assert!(pop.first(7).unwrap().is_null());
    }

    #[test]
    fn enumeration_in_insertion_order() {
        let path = pool_path("enum");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        let a = pop.alloc(8, 5).unwrap();
        let b = pop.alloc(8, 5).unwrap();
        let c = pop.alloc(8, 5).unwrap();

        assert_eq!(pop.first(5).unwrap(), a);
        assert_eq!(next(a), b);
        assert_eq!(next(b), c);
        assert!(next(c).is_null());
        assert!(next(Oid::NULL).is_null());

        // removing the middle element keeps the ring closed
        free(b);
        assert_eq!(next(a), c);
        assert!(next(c).is_null());
    }

    #[test]
    fn create_rejects_non_empty_file() {
        let path = pool_path("nonempty");
        {
            let f = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .unwrap();
            f.set_len(POOL_SIZE as u64).unwrap();
        }
        patch(&path, 0, &[0xFF]);
        assert!(matches!(
            ObjPool::create(&path, None, 0, 0o600),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn pool_file_is_exclusively_locked() {
        let path = pool_path("flock");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        assert!(matches!(ObjPool::open(&path, None), Err(Error::Io(_))));
        drop(pop);
        ObjPool::open(&path, None).unwrap();
    }

    #[test]
    fn duplicate_pool_id_is_rejected() {
        let path = pool_path("dup1");
        ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap().close();
        let copy = pool_path("dup2");
        fs::copy(&path, &copy).unwrap();

        let pop = ObjPool::open(&path, None).unwrap();
        assert!(matches!(
            ObjPool::open(&copy, None),
            Err(Error::AlreadyPresent)
        ));
        drop(pop);
    }

    #[test]
    fn committed_redo_section_is_reapplied_on_open() {
        let path = pool_path("redo");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        let o = pop.zalloc(64, 4).unwrap();
        pop.close();

        // hand-craft a committed-but-unapplied redo section in lane 0,
        // as a crash between commit and apply would leave it
        let marker = 0xfeed_face_cafe_beef_u64;
        patch(&path, OBJ_LANES_OFFSET + 8, &o.off.to_ne_bytes());
        patch(&path, OBJ_LANES_OFFSET + 16, &marker.to_ne_bytes());
        patch(&path, OBJ_LANES_OFFSET, &1u64.to_ne_bytes());

        let pop = ObjPool::open(&path, None).unwrap();
        let o = pop.first(4).unwrap();
        let mut word = [0u8; 8];
        word.copy_from_slice(payload(o, 8));
        assert_eq!(u64::from_ne_bytes(word), marker);
        pop.close();

        // recovery cleared the section on media
        assert_eq!(read_at(&path, OBJ_LANES_OFFSET, 8), vec![0u8; 8]);
    }

    #[test]
    fn invalid_redo_section_is_flagged() {
        let path = pool_path("badlane");
        ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap().close();

        patch(&path, OBJ_LANES_OFFSET, &999u64.to_ne_bytes());
        assert!(!ObjPool::check(&path, None).unwrap());
        assert!(matches!(
            ObjPool::open(&path, None),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn corrupt_heap_magic_is_fatal() {
        let path = pool_path("badheap");
        ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap().close();

        let heap_off =
            OBJ_LANES_OFFSET + (OBJ_NLANES * LANE_SIZE) as u64 + (NTYPES as u64 + 1) * LIST_HEAD_SIZE;
        patch(&path, heap_off, &0u64.to_ne_bytes());
        assert!(matches!(
            ObjPool::open(&path, None),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn unknown_ro_compat_demotes_to_read_only() {
        let path = pool_path("rocompat");
        ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap().close();

        let mut page = read_at(&path, 0, 4096);
        page[20] |= 0x01; // ro_compat_features
        let csum = utils::checksum(&page, HDR_CSUM_OFF as usize);
        page[4088..4096].copy_from_slice(&csum.to_le_bytes());
        patch(&path, 0, &page);

        let pop = ObjPool::open(&path, None).unwrap();
        assert!(pop.is_read_only());
        assert!(matches!(pop.alloc(8, 0), Err(Error::ReadOnly)));
    }

    #[test]
    fn unknown_incompat_is_fatal() {
        let path = pool_path("incompat");
        ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap().close();

        let mut page = read_at(&path, 0, 4096);
        page[16] |= 0x02; // incompat_features
        let csum = utils::checksum(&page, HDR_CSUM_OFF as usize);
        page[4088..4096].copy_from_slice(&csum.to_le_bytes());
        patch(&path, 0, &page);

        assert!(matches!(
            ObjPool::open(&path, None),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn pool_size_is_bounded_below() {
        let path = pool_path("small");
        assert!(matches!(
            ObjPool::create(&path, None, 1024 * 1024, 0o600),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn constructor_runs_inside_allocation() {
        let path = pool_path("ctor");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        let o = pop
            .alloc_construct(16, 2, Some(&|buf: &mut [u8]| {
                for b in buf.iter_mut() {
                    *b = 0x5A;
                }
            }))
            .unwrap();
        assert!(payload(o, 16).iter().all(|b| *b == 0x5A));
    }

    #[test]
    fn caller_embedded_lists() {
        let path = pool_path("userlist");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();

        // host two list heads in the root payload
        let r = pop.root(256).unwrap();
        fill(&pop, r, 0, 256);
        let head1 = r.off;
        let head2 = r.off + LIST_HEAD_SIZE;
        // entries live at the start of each element's payload
        let pe = OOB_OFFSET;

        let a = pop.list_insert_new(pe, head1, Oid::NULL, false, 64, 11).unwrap();
        let b = pop.list_insert_new(pe, head1, Oid::NULL, false, 64, 11).unwrap();

        let first_of = |head: u64| -> Oid {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&payload(r, 256)[(head - r.off) as usize..][..16]);
            Oid {
                pool_uuid_lo: u64::from_ne_bytes(raw[..8].try_into().unwrap()),
                off: u64::from_ne_bytes(raw[8..].try_into().unwrap()),
            }
        };

        assert_eq!(first_of(head1), a);
        assert_eq!(pop.first(11).unwrap(), a);
        assert_eq!(next(a), b);

        // the embedded entry of `a` points at `b`
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&payload(a, 16)[8..16]);
        assert_eq!(u64::from_ne_bytes(raw), b.off);

        pop.list_move(pe, head1, pe, head2, Oid::NULL, false, a).unwrap();
        assert_eq!(first_of(head1), b);
        assert_eq!(first_of(head2), a);

        // freeing through the list API leaves both rings
        pop.list_remove(pe, head2, a, true).unwrap();
        assert!(first_of(head2).is_null());
        assert_eq!(pop.first(11).unwrap(), b);
        assert!(next(b).is_null());

        pop.list_remove(pe, head1, b, false).unwrap();
        assert!(first_of(head1).is_null());
        // still on its type list
        assert_eq!(pop.first(11).unwrap(), b);
    }

    #[test]
    fn direct_translates_only_known_pools() {
        let path = pool_path("direct");
        let pop = ObjPool::create(&path, None, POOL_SIZE, 0o600).unwrap();
        let o = pop.alloc(8, 0).unwrap();
        assert!(!direct(o).is_null());
        assert!(direct(Oid::NULL).is_null());
        assert!(direct(Oid {
            pool_uuid_lo: 0x1234_5678_9abc_def0,
            off: 64
        })
        .is_null());

        drop(pop);
        assert!(direct(o).is_null());
        assert_eq!(alloc_usable_size(o), 0);
    }

    #[test]
    fn many_objects_reopen_intact() {
        let path = pool_path("many");
        let pop = ObjPool::create(&path, Some("bulk"), POOL_SIZE, 0o600).unwrap();
        let mut oids = Vec::new();
        for i in 0..128usize {
            let o = pop.alloc(24 + i, (i % 7) as usize).unwrap();
            fill(&pop, o, i as u8, 24);
            oids.push(o);
        }
        for (i, o) in oids.iter().enumerate() {
            if i % 3 == 0 {
                free(*o);
            }
        }
        pop.close();

        let pop = ObjPool::open(&path, Some("bulk")).unwrap();
        for (i, o) in oids.iter().enumerate() {
            if i % 3 == 0 {
                continue;
            }
            assert!(payload(*o, 24).iter().all(|b| *b == i as u8), "object {}", i);
        }
        // every surviving object is reachable from its type list
        for t in 0..7usize {
            let mut cur = pop.first(t).unwrap();
            let mut seen = 0;
            while !cur.is_null() {
                seen += 1;
                cur = next(cur);
            }
            let expect = oids
                .iter()
                .enumerate()
                .filter(|(i, _)| i % 3 != 0 && i % 7 == t)
                .count();
            assert_eq!(seen, expect, "type {}", t);
        }
        pop.close();

        assert!(ObjPool::check(&path, Some("bulk")).unwrap());
    }
}
