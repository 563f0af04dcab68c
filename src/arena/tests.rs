//! Unit tests for arenas and the arena registry

use super::*;
use crate::config::RegistryConfig;
use crate::platform::faulty::FaultyMemory;

const PAGE: usize = 4096;

fn page() -> usize {
    platform::page_size()
}

fn arena(reserved_pages: usize, committed_pages: usize) -> Arena {
    Arena::new(ArenaParams::new(reserved_pages * page(), committed_pages * page())).unwrap()
}

#[test]
fn test_new_rounds_to_pages() {
    let arena = Arena::new(ArenaParams::new(10 * PAGE + 1, PAGE + 1)).unwrap();
    assert!(arena.is_valid());
    assert_eq!(arena.position(), 0);
    assert!(arena.reserved_bytes() >= 10 * PAGE + 1);
    assert!(arena.committed_bytes() >= PAGE + 1);
    assert_eq!(arena.reserved_bytes() % arena.page_size(), 0);
    assert_eq!(arena.alignment(), 8);
}

#[test]
fn test_page_size_never_below_os_page() {
    let params = ArenaParams::new(1 << 20, 1 << 16).with_page_size_shift(16);
    let arena = Arena::new(params).unwrap();
    assert_eq!(arena.page_size(), (1 << 16).max(page()));
    assert_eq!(arena.page_size_shift() as u32, arena.page_size().trailing_zeros());

    let arena = Arena::new(ArenaParams::new(1 << 20, 0)).unwrap();
    assert_eq!(arena.page_size(), page());
}

#[test]
fn test_push_commits_lazily() {
    let mut arena = arena(16, 1);
    let first = arena.push(page()).unwrap();
    assert_eq!(arena.committed_pages(), 1);
    assert_eq!(first, arena.base());

    let second = arena.push(1).unwrap();
    assert_eq!(arena.committed_pages(), 2);
    unsafe {
        assert_eq!(second.as_ptr().offset_from(first.as_ptr()) as usize, page());
        second.as_ptr().write(42);
    }
    assert_eq!(arena.position(), page() + 1);
}

#[test]
fn test_push_rejects_empty_and_oversized() {
    let mut arena = arena(4, 1);
    assert!(matches!(arena.push(0), Err(VmemError::Grow { requested: 0, .. })));

    arena.push(10).unwrap();
    let err = arena.push(4 * page()).unwrap_err();
    assert!(matches!(err, VmemError::Grow { .. }));
    assert_eq!(arena.position(), 10);
    assert_eq!(arena.committed_pages(), 1);
    assert!(arena.push(usize::MAX).is_err());
    assert_eq!(arena.position(), 10);
}

#[test]
fn test_push_aligned() {
    let mut arena = arena(4, 1);
    arena.push(3).unwrap();
    let ptr = arena.push_aligned(16, 64).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 64, 0);
    assert_eq!(arena.position(), 64 + 16);

    // Arena minimum alignment (8) wins over a smaller request.
    arena.push(1).unwrap();
    let ptr = arena.push_aligned(8, 1).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 8, 0);

    assert!(arena.push_aligned(8, 3).is_err());
}

#[test]
fn test_push_zero_clears_reused_memory() {
    let mut arena = arena(4, 1);
    let ptr = arena.push(64).unwrap();
    unsafe { ptr.as_ptr().write_bytes(0xFF, 64) };
    arena.pop(64);

    let ptr = arena.push_zero(64).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(bytes.iter().all(|b| *b == 0));

    let ptr = arena.push_zero_aligned(32, 32).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 32, 0);
}

#[test]
fn test_pop_clamps() {
    let mut arena = arena(4, 1);
    arena.push(100).unwrap();
    arena.pop(40);
    assert_eq!(arena.position(), 60);
    arena.pop(1000);
    assert_eq!(arena.position(), 0);

    arena.push(50).unwrap();
    arena.pop_to(80);
    assert_eq!(arena.position(), 50);
    arena.pop_to(20);
    assert_eq!(arena.position(), 20);
}

#[test]
fn test_clear_trims_to_whole_pages() {
    let mut arena = arena(16, 8);
    arena.push(3 * page()).unwrap();

    arena.clear(2 * page() + 1);
    assert_eq!(arena.position(), 0);
    assert_eq!(arena.committed_pages(), 3);

    arena.clear(0);
    assert_eq!(arena.committed_pages(), 1);
    assert!(arena.is_valid());

    // Keeping more than is committed changes nothing.
    arena.clear(10 * page());
    assert_eq!(arena.committed_pages(), 1);
}

#[test]
fn test_clear_survives_decommit_failure() {
    let vm = FaultyMemory::leaked();
    let mut arena = Arena::with_backend(vm, ArenaParams::new(8 * page(), 4 * page())).unwrap();
    arena.push(100).unwrap();
    vm.set_fail_decommit(true);

    arena.clear(0);
    assert_eq!(arena.position(), 0);
    assert_eq!(arena.committed_pages(), 4);
    vm.set_fail_decommit(false);
}

#[test]
fn test_explicit_commit() {
    let mut arena = arena(8, 1);
    arena.commit(5 * page()).unwrap();
    assert_eq!(arena.committed_pages(), 5);

    arena.push(4 * page()).unwrap();
    arena.commit(2 * page()).unwrap();
    assert_eq!(arena.committed_pages(), 2);
    assert_eq!(arena.position(), 2 * page());

    assert!(matches!(arena.commit(9 * page()), Err(VmemError::Grow { .. })));
    assert_eq!(arena.committed_pages(), 2);
}

#[test]
fn test_explicit_commit_propagates_os_failures() {
    let vm = FaultyMemory::leaked();
    let mut arena = Arena::with_backend(vm, ArenaParams::new(8 * page(), 2 * page())).unwrap();
    arena.push(100).unwrap();

    vm.set_fail_commit(true);
    let err = arena.commit(4 * page()).unwrap_err();
    assert!(matches!(err, VmemError::CommitFailed { size, .. } if size == 2 * page()));
    assert_eq!(arena.committed_pages(), 2);
    assert_eq!(arena.position(), 100);
    vm.set_fail_commit(false);

    vm.set_fail_decommit(true);
    let err = arena.commit(page()).unwrap_err();
    assert!(matches!(err, VmemError::DecommitFailed { size, .. } if size == page()));
    assert_eq!(arena.committed_pages(), 2);
    assert_eq!(arena.position(), 100);
    vm.set_fail_decommit(false);

    arena.commit(page()).unwrap();
    assert_eq!(arena.committed_pages(), 1);
}

#[test]
fn test_commit_failure_releases_reservation() {
    let vm = FaultyMemory::leaked();
    vm.set_fail_commit(true);
    let err = Arena::with_backend(vm, ArenaParams::new(4 * page(), page())).unwrap_err();
    assert!(matches!(err, VmemError::CommitFailed { .. }));
    assert_eq!(vm.release_calls(), 1);
}

#[test]
fn test_reserve_failure_is_reported() {
    let vm = FaultyMemory::leaked();
    vm.set_fail_reserve(true);
    let err = Arena::with_backend(vm, ArenaParams::new(4 * page(), page())).unwrap_err();
    assert!(matches!(err, VmemError::ReserveFailed { .. }));
    assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    assert_eq!(vm.commit_calls(), 0);
}

#[test]
fn test_push_reports_failed_commit_as_grow() {
    let vm = FaultyMemory::leaked();
    let mut arena = Arena::with_backend(vm, ArenaParams::new(4 * page(), page())).unwrap();
    vm.set_fail_commit(true);
    assert!(matches!(arena.push(2 * page()), Err(VmemError::Grow { .. })));
    assert_eq!(arena.position(), 0);
    assert_eq!(arena.committed_pages(), 1);
    vm.set_fail_commit(false);
    arena.release().unwrap();
    assert_eq!(vm.release_calls(), 1);
}

#[test]
fn test_invalid_params_never_reach_os() {
    let vm = FaultyMemory::leaked();
    let err = Arena::with_backend(vm, ArenaParams::new(PAGE, 0).with_alignment_shift(20)).unwrap_err();
    assert!(matches!(err, VmemError::InvalidAlignmentShift { shift: 20 }));
    assert_eq!(vm.commit_calls(), 0);
}

#[test]
fn test_zero_commit_arena_is_not_valid_until_push() {
    let mut arena = arena(4, 0);
    assert!(!arena.is_valid());
    arena.push(1).unwrap();
    assert!(arena.is_valid());
}

// ============================================================================
// Registry
// ============================================================================

fn registry(initial: usize, max: usize) -> ArenaRegistry {
    ArenaRegistry::new(RegistryConfig::new(initial, max)).unwrap()
}

#[test]
fn test_registry_alloc_and_release() {
    let mut reg = registry(4, 16);
    let handle = reg.alloc(16 * PAGE, 4 * PAGE).unwrap();
    assert_eq!(reg.live_count(), 1);
    assert!(reg.is_valid(handle));

    let arena = reg.get_mut(handle).unwrap();
    arena.push(128).unwrap();
    assert_eq!(reg.get(handle).unwrap().position(), 128);

    reg.release(handle).unwrap();
    assert_eq!(reg.live_count(), 0);
    assert!(!reg.is_valid(handle));
}

#[test]
fn test_registry_rejects_stale_handles() {
    let mut reg = registry(4, 16);
    let old = reg.alloc(PAGE, PAGE).unwrap();
    reg.release(old).unwrap();

    assert!(matches!(reg.release(old), Err(VmemError::StaleHandle { .. })));
    assert!(reg.get(old).is_err());

    // The slot is reused under a new generation.
    let new = reg.alloc(PAGE, PAGE).unwrap();
    assert_eq!(new.index(), old.index());
    assert_ne!(new.generation(), old.generation());
    assert!(reg.get(old).is_err());
    assert!(reg.get(new).is_ok());
    assert_eq!(reg.high_water(), 1);
}

#[test]
fn test_registry_reuses_most_recently_freed() {
    let mut reg = registry(4, 16);
    let handles: Vec<_> = (0..3).map(|_| reg.alloc(PAGE, PAGE).unwrap()).collect();
    reg.release(handles[0]).unwrap();
    reg.release(handles[2]).unwrap();

    assert_eq!(reg.alloc(PAGE, PAGE).unwrap().index(), 2);
    assert_eq!(reg.alloc(PAGE, PAGE).unwrap().index(), 0);
    assert_eq!(reg.alloc(PAGE, PAGE).unwrap().index(), 3);
}

#[test]
fn test_registry_names() {
    let mut reg = registry(2, 4);
    let handle = reg.alloc(PAGE, PAGE).unwrap();
    assert_eq!(reg.name(handle).unwrap(), None);
    reg.set_name(handle, "scratch").unwrap();
    assert_eq!(reg.name(handle).unwrap(), Some("scratch"));

    reg.release(handle).unwrap();
    assert!(reg.set_name(handle, "late").is_err());
    let handle = reg.alloc(PAGE, PAGE).unwrap();
    assert_eq!(reg.name(handle).unwrap(), None);
}

#[test]
fn test_registry_grows_before_handing_out_slot() {
    let mut reg = registry(2, 1024);
    assert_eq!(reg.slot_capacity(), 2);
    let handles: Vec<_> = (0..3).map(|_| reg.alloc(PAGE, PAGE).unwrap()).collect();
    assert!(reg.slot_capacity() > 2);
    assert!(reg.slot_capacity() <= 1024);
    assert!(handles.iter().all(|h| reg.is_valid(*h)));
}

#[test]
fn test_registry_full() {
    let mut reg = registry(1, 3);
    for _ in 0..3 {
        reg.alloc(PAGE, PAGE).unwrap();
    }
    assert_eq!(reg.slot_capacity(), 3);
    let err = reg.alloc(PAGE, PAGE).unwrap_err();
    assert!(matches!(err, VmemError::RegistryFull { max_slots: 3 }));
    assert_eq!(reg.live_count(), 3);
}

#[test]
fn test_registry_uses_default_shifts() {
    let config = RegistryConfig {
        default_alignment_shift: 6,
        default_page_size_shift: 16,
        ..RegistryConfig::new(4, 8)
    };
    let mut reg = ArenaRegistry::new(config).unwrap();
    assert_eq!(reg.default_alignment_shift(), 6);
    assert_eq!(reg.default_page_size_shift(), 16);

    let handle = reg.alloc(1 << 20, 1).unwrap();
    let arena = reg.get(handle).unwrap();
    assert_eq!(arena.alignment(), 64);
    assert!(arena.page_size() >= 1 << 16);

    let err = reg.alloc_with(ArenaParams::new(PAGE, 0).with_page_size_shift(21)).unwrap_err();
    assert!(matches!(err, VmemError::InvalidPageSizeShift { shift: 21 }));
}

#[test]
fn test_registry_teardown_releases_live_arenas() {
    let vm = FaultyMemory::leaked();
    let mut reg = ArenaRegistry::with_backend(vm, RegistryConfig::new(4, 8)).unwrap();
    let a = reg.alloc(PAGE, PAGE).unwrap();
    reg.alloc(PAGE, PAGE).unwrap();
    reg.release(a).unwrap();
    assert_eq!(vm.release_calls(), 1);

    reg.teardown().unwrap();
    // One more arena plus the slot table.
    assert_eq!(vm.release_calls(), 3);
}

#[test]
fn test_registry_teardown_reports_slot_table_failure() {
    let vm = FaultyMemory::leaked();
    let mut reg = ArenaRegistry::with_backend(vm, RegistryConfig::new(4, 8)).unwrap();
    let a = reg.alloc(PAGE, PAGE).unwrap();
    reg.release(a).unwrap();

    vm.set_fail_release(true);
    let err = reg.teardown().unwrap_err();
    assert!(matches!(err, VmemError::ReleaseFailed { .. }));
    assert_eq!(vm.release_calls(), 2);
}

#[test]
fn test_registry_drop_releases_everything() {
    let vm = FaultyMemory::leaked();
    {
        let mut reg = ArenaRegistry::with_backend(vm, RegistryConfig::new(4, 8)).unwrap();
        reg.alloc(PAGE, PAGE).unwrap();
        reg.alloc(PAGE, PAGE).unwrap();
    }
    assert_eq!(vm.release_calls(), 3);
}

#[test]
fn test_shared_registry() {
    let shared = ArenaRegistry::shared(RegistryConfig::default()).unwrap();
    let handle = shared.lock().alloc(PAGE, PAGE).unwrap();
    shared.lock().get_mut(handle).unwrap().push(16).unwrap();
    assert_eq!(shared.lock().get(handle).unwrap().position(), 16);
    shared.lock().release(handle).unwrap();
}
