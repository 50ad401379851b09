//! # Ownership Tree Sweep
//!
//! Thirteen blocks form a ternary tree under node 0. Any subset of nodes is
//! grown (possibly moved), any subset of non-root nodes is detached, then
//! the root is released. Exactly the nodes still connected to the root must
//! be gone.
//!
//! The default run sweeps every detach mask against a few resize masks and
//! every resize mask against a few detach masks. The full cross product is
//! `#[ignore]`d; run it with `cargo test -- --ignored`.

use oroboros_memory::{kilobytes, Arena, ArenaConfig, ArenaPtr};

const NODES: usize = 13;
const ALL: u32 = (1 << NODES) - 1;

/// Parent of `node` in the ternary tree.
const fn parent(node: usize) -> Option<usize> {
    if node == 0 {
        None
    } else {
        Some((node - 1) / 3)
    }
}

/// Whether releasing the root should take `node` with it.
fn released_with_root(node: usize, detach: u32) -> bool {
    let mut cursor = node;
    while let Some(up) = parent(cursor) {
        if detach & (1 << cursor) != 0 {
            return false;
        }
        cursor = up;
    }
    true
}

fn run(detach: u32, resize: u32) {
    let arena = Arena::new(ArenaConfig {
        total_size: kilobytes(32),
        verify_every_change: true,
        debug_fill: false,
        track_origins: false,
    })
    .unwrap();

    let mut nodes: Vec<ArenaPtr> = (0..NODES)
        .map(|_| arena.allocate(100).unwrap().unwrap())
        .collect();
    // Keeps the last node from growing into the arena's tail.
    let junk = arena.allocate(100).unwrap().unwrap();

    for node in 1..NODES {
        let up = parent(node).unwrap();
        assert!(arena.attach(nodes[up], nodes[node]));
    }

    for (node, ptr) in nodes.iter_mut().enumerate() {
        if resize & (1 << node) != 0 {
            *ptr = arena.resize(*ptr, 200).unwrap().unwrap();
        }
    }

    for (node, &ptr) in nodes.iter().enumerate().skip(1) {
        if detach & (1 << node) != 0 {
            arena.detach_from_parent(ptr);
        }
    }

    arena.release(nodes[0]);
    for (node, &ptr) in nodes.iter().enumerate() {
        assert_eq!(
            arena.is_allocated(ptr),
            !released_with_root(node, detach),
            "node {node}, detach {detach:#06x}, resize {resize:#06x}"
        );
    }

    // Survivors are roots of their own subtrees: releasing every detached
    // node leaves only the junk block.
    for (node, &ptr) in nodes.iter().enumerate().skip(1) {
        if detach & (1 << node) != 0 && arena.is_allocated(ptr) && arena.parent_of(ptr).is_none() {
            arena.release(ptr);
        }
    }
    let report = arena.report();
    assert_eq!(report.in_use, arena.size_of(junk).unwrap());
    assert!(arena.get_verify());
}

#[test]
fn test_expected_release_set() {
    assert!(released_with_root(0, ALL));
    assert!(released_with_root(12, 0));
    assert!(!released_with_root(12, 1 << 3));
    assert!(!released_with_root(12, 1 << 12));
    assert!(released_with_root(12, 1 << 2));
}

#[test]
fn test_every_detach_combination() {
    for resize in [0, ALL, 0b1_0101_0101_0101, 0b0_0000_0000_0001] {
        for detach in 0..=ALL {
            run(detach, resize);
        }
    }
}

#[test]
fn test_every_resize_combination() {
    for detach in [0, ALL, 0b0_0000_0000_1110, 0b1_1111_1111_0000] {
        for resize in 0..=ALL {
            run(detach, resize);
        }
    }
}

#[test]
#[ignore = "runs all 2^26 combinations"]
fn test_every_detach_and_resize_combination() {
    for detach in 0..=ALL {
        for resize in 0..=ALL {
            run(detach, resize);
        }
    }
}
