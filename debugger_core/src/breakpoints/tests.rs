use super::{BreakpointKind, BreakpointManager};
use crate::address::Address;
use crate::library::{LibraryArena, LibraryId};

// Arena ids are assigned in intern order
const FOO: LibraryId = LibraryId(0);
const BAR: LibraryId = LibraryId(1);

fn arena() -> LibraryArena {
    let mut arena = LibraryArena::default();
    arena.intern("libfoo.so");
    arena.intern("libbar.so");
    arena
}

fn manager() -> (BreakpointManager, LibraryArena) {
    (BreakpointManager::new(false), arena())
}

#[test]
pub fn when_add_breakpoint_then_id_is_assigned_in_order() {
    let (mut manager, _arena) = manager();

    let a = manager
        .add(&Address::new(FOO, 0x1000), true, BreakpointKind::Uprobe)
        .unwrap();
    let b = manager
        .add(&Address::new(FOO, 0x2000), true, BreakpointKind::Uprobe)
        .unwrap();
    assert_eq!(a, 0);
    assert_eq!(b, 1);
}

#[test]
pub fn when_add_same_identity_then_enable_is_updated_not_duplicated() {
    let (mut manager, _arena) = manager();

    let a = manager
        .add(&Address::new(FOO, 0x1000), true, BreakpointKind::Uprobe)
        .unwrap();
    let b = manager
        .add(&Address::new(FOO, 0x1000), false, BreakpointKind::Uprobe)
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(manager.list().count(), 1);
    assert!(!manager.list().next().unwrap().1.enable);
}

#[test]
pub fn when_same_offset_in_different_libraries_then_two_entries() {
    let (mut manager, _arena) = manager();

    manager
        .add(&Address::new(FOO, 0x1000), true, BreakpointKind::Uprobe)
        .unwrap();
    manager
        .add(&Address::new(BAR, 0x1000), true, BreakpointKind::Uprobe)
        .unwrap();
    assert_eq!(manager.list().count(), 2);
}

#[test]
pub fn when_delete_breakpoint_then_surrounding_ids_are_preserved() {
    let (mut manager, _arena) = manager();

    manager
        .add(&Address::new(FOO, 0x1000), true, BreakpointKind::Uprobe)
        .unwrap();
    manager
        .add(&Address::new(FOO, 0x2000), true, BreakpointKind::Uprobe)
        .unwrap();
    manager
        .add(&Address::new(FOO, 0x3000), true, BreakpointKind::Uprobe)
        .unwrap();

    manager.delete(1).unwrap();

    let ids: Vec<usize> = manager.list().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![0, 2]);

    // Deleting again or toggling the tombstone is a user error
    assert!(manager.delete(1).is_err());
    assert!(manager.change(1, true).is_err());
    assert!(manager.delete(99).is_err());

    // A new breakpoint gets a fresh id, tombstones keep their slot
    let id = manager
        .add(&Address::new(FOO, 0x4000), true, BreakpointKind::Uprobe)
        .unwrap();
    assert_eq!(id, 3);
}

#[test]
pub fn when_misaligned_offset_then_parse_error() {
    let (mut manager, _arena) = manager();

    assert!(manager
        .add(&Address::new(FOO, 0x1001), true, BreakpointKind::Uprobe)
        .is_err());
    assert!(manager.set_temporary(Address::new(FOO, 0x1002), 0).is_err());
}

#[test]
pub fn when_snapshot_then_only_enabled_entries_plus_temporary() {
    let (mut manager, arena) = manager();

    manager
        .add(&Address::new(FOO, 0x1000), true, BreakpointKind::Uprobe)
        .unwrap();
    manager
        .add(&Address::new(FOO, 0x2000), false, BreakpointKind::Uprobe)
        .unwrap();
    let deleted = manager
        .add(&Address::new(FOO, 0x3000), true, BreakpointKind::Uprobe)
        .unwrap();
    manager.delete(deleted).unwrap();
    manager.set_temporary(Address::new(FOO, 0x4000), 1234).unwrap();

    let snapshot = manager.snapshot_for_install(&arena);
    let labels: Vec<&str> = snapshot.iter().map(|e| e.label.as_str()).collect();
    assert_eq!(labels, vec!["libfoo.so+0x1000", "libfoo.so+0x4000"]);
    assert!(!snapshot[0].temporary);
    assert!(snapshot[1].temporary);
}

#[test]
pub fn when_temporary_matches_enabled_breakpoint_then_it_is_dropped() {
    let (mut manager, arena) = manager();

    manager
        .add(&Address::new(FOO, 0x1000), true, BreakpointKind::Uprobe)
        .unwrap();
    manager.set_temporary(Address::new(FOO, 0x1000), 77).unwrap();
    assert!(!manager.has_temporary());

    let snapshot = manager.snapshot_for_install(&arena);
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot[0].temporary);
}

#[test]
pub fn when_data_dependent_pair_is_armed_then_snapshot_carries_both() {
    let (mut manager, arena) = manager();

    manager.set_temporary(Address::new(FOO, 0x1000), 77).unwrap();
    manager.push_temporary(Address::new(FOO, 0x2000), 77).unwrap();

    let snapshot = manager.snapshot_for_install(&arena);
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|e| e.temporary));

    manager.clear_temporaries();
    assert!(manager.snapshot_for_install(&arena).is_empty());
}

#[test]
pub fn when_snapshot_has_duplicate_identities_then_they_are_merged() {
    let (mut manager, arena) = manager();

    manager
        .add(&Address::new(FOO, 0x1000), true, BreakpointKind::Uprobe)
        .unwrap();
    // Same identity arriving through the temporary path
    manager.set_temporary(Address::new(FOO, 0x2000), 0).unwrap();
    manager.push_temporary(Address::new(FOO, 0x2000), 0).unwrap();

    let snapshot = manager.snapshot_for_install(&arena);
    assert_eq!(snapshot.len(), 2);
}

