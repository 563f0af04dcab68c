use proptest::prelude::*;
use std::collections::HashSet;
use std::ptr::NonNull;
use vmarena::{Pool, VirtualArray, VirtualPool, VmemError};

#[test]
fn test_pool_write_across_initial_items() {
    let mut pool = VirtualPool::new(20, 4, 4096, 65536).unwrap();
    assert_eq!(pool.item_size(), 20);
    assert!(pool.capacity() >= 4096);

    let first = pool.allocate().unwrap();
    unsafe { first.as_ptr().write_bytes(0x11, 4096 * 20) };
    for index in (0..4096u32).step_by(97) {
        let byte = unsafe { *pool.ptr_at(index).as_ptr() };
        assert_eq!(byte, 0x11);
    }

    pool.teardown().unwrap();
}

#[test]
fn test_pool_exhaustion() {
    let mut pool = VirtualPool::new(64, 8, 1, 10).unwrap();
    let live: Vec<_> = (0..10).map(|_| pool.allocate().unwrap()).collect();
    assert!(matches!(pool.allocate(), Err(VmemError::PoolExhausted { .. })));

    unsafe { pool.deallocate(live[4]) };
    assert_eq!(pool.allocate().unwrap(), live[4]);
}

#[test]
fn test_typed_pool_roundtrip() {
    let mut pool = Pool::<[u64; 4]>::setup(16, 100_000).unwrap();
    let ptrs: Vec<_> = (0..1000u64).map(|i| pool.alloc([i; 4]).unwrap()).collect();
    assert_eq!(pool.len(), 1000);
    assert!(pool.capacity() >= 1000);

    for (i, ptr) in ptrs.iter().enumerate() {
        assert_eq!(pool.index_of(*ptr) as usize, i);
        assert_eq!(unsafe { ptr.as_ref() }[3], i as u64);
    }
    for ptr in ptrs {
        unsafe { pool.free(ptr) };
    }
    assert!(pool.is_empty());
}

#[test]
fn test_array_tracks_length() {
    let mut array = VirtualArray::new(32, 100, 1 << 20).unwrap();
    assert_eq!(array.len(), 100);

    array.set_len(10_000).unwrap();
    let last = array.get(9_999).unwrap();
    unsafe { last.as_ptr().write_bytes(7, 32) };
    assert!(array.capacity() >= 10_000);

    array.set_len(10).unwrap();
    assert!(array.get(10).is_none());
    assert!(array.committed_pages() <= 1);

    assert!(matches!(array.set_len(array.max_items() + 1), Err(VmemError::Grow { .. })));
}

#[derive(Debug, Clone)]
enum Op {
    Alloc,
    Free(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![3 => Just(Op::Alloc), 2 => any::<usize>().prop_map(Op::Free)],
        1..400,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pool_counts_outstanding(ops in ops(), growable in any::<bool>()) {
        let mut pool = if growable {
            VirtualPool::growable(24, 8, 4, 512).unwrap()
        } else {
            VirtualPool::new(24, 8, 4, 512).unwrap()
        };
        let mut live: Vec<NonNull<u8>> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc => {
                    let ptr = pool.allocate().unwrap();
                    prop_assert!(!live.contains(&ptr));
                    unsafe { ptr.as_ptr().write_bytes(0xAA, 24) };
                    live.push(ptr);
                }
                Op::Free(pick) if !live.is_empty() => {
                    let ptr = live.swap_remove(pick % live.len());
                    unsafe { pool.deallocate(ptr) };
                }
                Op::Free(_) => {}
            }
            prop_assert_eq!(pool.len(), live.len());
            prop_assert!(pool.len() <= pool.capacity());
        }

        let unique: HashSet<_> = live.iter().collect();
        prop_assert_eq!(unique.len(), live.len());
    }

    #[test]
    fn prop_pool_index_roundtrip(count in 1usize..300) {
        let mut pool = VirtualPool::growable(40, 8, 1, 1000).unwrap();
        let ptrs: Vec<_> = (0..count).map(|_| pool.allocate().unwrap()).collect();
        for ptr in ptrs {
            prop_assert_eq!(pool.ptr_at(pool.index_of(ptr)), ptr);
        }
    }
}
