//! Basic allocation and collection behavior.

use tacit_gc::{test_util, Gc, Heap};

#[test]
fn allocate_and_borrow() {
    let heap = Heap::new();
    let x = heap.new_object(42);
    assert_eq!(*x.borrow(), 42);
}

#[test]
fn borrow_reaches_into_owned_data() {
    let heap = Heap::new();
    let s = heap.new_object(String::from("hello"));
    assert_eq!(*s.borrow(), "hello");
    assert_eq!(s.borrow().len(), 5);
}

#[test]
fn clone_shares_the_referent() {
    let heap = Heap::new();
    let x = heap.new_object(42);
    let y = x.clone();
    assert!(Gc::ptr_eq(&x, &y));
    assert_eq!(*y.borrow(), 42);
    assert_eq!(test_util::live_allocations(&heap), 1);
}

#[test]
fn distinct_objects_are_not_ptr_equal() {
    let heap = Heap::new();
    let x = heap.new_object(42);
    let z = heap.new_object(42);
    assert!(!Gc::ptr_eq(&x, &z));
    assert_eq!(x, z); // value equality still holds
}

#[test]
fn live_handles_keep_allocations_across_collect() {
    let heap = Heap::new();
    let x = heap.new_object(String::from("keep me"));
    heap.collect();
    heap.collect();
    assert_eq!(*x.borrow(), "keep me");
    assert_eq!(test_util::live_allocations(&heap), 1);
}

#[test]
fn borrowed_referents_survive_collection() {
    let heap = Heap::new();
    let x = heap.new_object(String::from("pinned"));
    let guard = x.borrow();
    heap.collect();
    assert_eq!(*guard, "pinned");
    drop(guard);
}

#[test]
fn dropping_the_last_handle_makes_the_object_collectable() {
    let heap = Heap::new();
    let x = heap.new_object(42);
    assert_eq!(test_util::live_allocations(&heap), 1);
    drop(x);
    // Nothing is reclaimed until a pass runs.
    assert_eq!(test_util::live_allocations(&heap), 1);
    heap.collect();
    assert_eq!(test_util::live_allocations(&heap), 0);
    assert_eq!(test_util::registered_handles(&heap), (0, 0));
}

#[test]
fn reset_unregisters_without_collecting() {
    let heap = Heap::new();
    let x = heap.new_object(7);
    x.reset();
    assert!(x.is_empty());
    assert_eq!(test_util::registered_handles(&heap), (0, 0));
    heap.collect();
    assert_eq!(test_util::live_allocations(&heap), 0);
}

#[test]
#[should_panic(expected = "borrowed")]
fn reset_of_a_borrowed_handle_panics() {
    let heap = Heap::new();
    let x = heap.new_object(7);
    let guard = x.borrow();
    x.reset();
    drop(guard);
}

#[test]
fn collect_stats_report_the_sweep() {
    let heap = Heap::new();
    let keep = heap.new_object([0u8; 64]);
    let lose = heap.new_object([0u8; 64]);
    drop(lose);
    heap.collect();
    let stats = heap.last_collect_stats();
    assert_eq!(stats.storages_reclaimed, 1);
    assert_eq!(stats.bytes_reclaimed, 64);
    assert_eq!(stats.storages_live, 1);
    assert_eq!(stats.bytes_live, 64);
    drop(keep);
}

#[test]
fn many_allocations_round_trip() {
    let heap = Heap::new();
    let values: Vec<_> = (0..100usize).map(|i| heap.new_object(i)).collect();
    for (i, gc) in values.iter().enumerate() {
        assert_eq!(*gc.borrow(), i);
    }
    // Handles inside a `Vec` live in non-managed memory and are roots.
    assert_eq!(test_util::registered_handles(&heap), (100, 0));
    drop(values);
    heap.collect();
    assert_eq!(test_util::live_allocations(&heap), 0);
}

#[test]
fn debug_formats_the_referent() {
    let heap = Heap::new();
    let x = heap.new_object(42);
    assert_eq!(format!("{x:?}"), "Gc(42)");
}

#[test]
fn stack_handles_are_strong_roots() {
    let heap = Heap::new();
    let x = heap.new_object(1);
    assert!(test_util::is_root(&x));
    assert!(test_util::holds_collector_strongly(&x));
    test_util::check_invariants(&heap);
}
