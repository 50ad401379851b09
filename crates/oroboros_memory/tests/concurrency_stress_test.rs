//! # Concurrency and Stress Tests
//!
//! Many threads sharing one arena, and a long seeded random walk over the
//! whole API with an integrity check after every step.

use oroboros_memory::{kilobytes, megabytes, Arena, ArenaConfig, ArenaPtr, MemoryError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;

#[test]
fn test_threads_share_one_arena() {
    let arena = Arc::new(
        Arena::new(ArenaConfig {
            total_size: megabytes(4),
            verify_every_change: false,
            debug_fill: false,
            track_origins: true,
        })
        .unwrap(),
    );
    let num_threads = 8;
    let rounds = 500;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let arena = Arc::clone(&arena);
            thread::spawn(move || {
                let tag = t as u8;
                for round in 0..rounds {
                    let root = arena.allocate(64 + round % 200).unwrap().unwrap();
                    let leaf = arena.allocate(32).unwrap().unwrap();
                    assert!(arena.attach(root, leaf));

                    arena.with_bytes_mut(leaf, |bytes| bytes.fill(tag)).unwrap();
                    let root = arena.resize(root, 512).unwrap().unwrap();
                    arena
                        .with_bytes(leaf, |bytes| assert!(bytes.iter().all(|&b| b == tag)))
                        .unwrap();

                    assert_eq!(arena.parent_of(leaf), Some(root));
                    arena.release(root);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    arena.verify();
    assert_eq!(arena.memory_used(), 0);
    assert_eq!(arena.report().fragments, 1);
}

/// A live allocation and the byte it was painted with.
struct Live {
    ptr: ArenaPtr,
    paint: u8,
}

#[test]
fn test_seeded_random_operations() {
    let arena = Arena::new(ArenaConfig {
        total_size: kilobytes(256),
        verify_every_change: false,
        debug_fill: true,
        track_origins: true,
    })
    .unwrap();
    let mut rng = StdRng::seed_from_u64(0x0B0B_05);
    let mut live: Vec<Live> = Vec::new();

    for step in 0..20_000u32 {
        match rng.gen_range(0..10) {
            0..=3 => {
                let size = rng.gen_range(1..2048);
                match arena.allocate(size) {
                    Ok(Some(ptr)) => {
                        let paint = rng.gen();
                        arena.with_bytes_mut(ptr, |bytes| bytes.fill(paint)).unwrap();
                        live.push(Live { ptr, paint });
                    }
                    Ok(None) => unreachable!("non-zero size"),
                    Err(MemoryError::OutOfMemory { .. }) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            4..=5 if !live.is_empty() => {
                let index = rng.gen_range(0..live.len());
                let entry = &mut live[index];
                let old_size = arena.size_of(entry.ptr).unwrap();
                let new_size = rng.gen_range(1..4096);
                if let Ok(Some(ptr)) = arena.resize(entry.ptr, new_size) {
                    if new_size < old_size {
                        assert_eq!(ptr, entry.ptr, "shrink moved at step {step}");
                    }
                    let kept = old_size.min(new_size);
                    arena
                        .with_bytes(ptr, |bytes| {
                            assert!(bytes[..kept].iter().all(|&b| b == entry.paint), "step {step}");
                        })
                        .unwrap();
                    let paint = entry.paint;
                    arena.with_bytes_mut(ptr, |bytes| bytes.fill(paint)).unwrap();
                    entry.ptr = ptr;
                }
            }
            6..=7 if !live.is_empty() => {
                // Releasing may cascade; drop whatever went with it.
                let index = rng.gen_range(0..live.len());
                let victim = live.swap_remove(index);
                arena.release(victim.ptr);
                live.retain(|entry| arena.size_of(entry.ptr).is_some());
            }
            8 if live.len() >= 2 => {
                let parent = live[rng.gen_range(0..live.len())].ptr;
                let child = live[rng.gen_range(0..live.len())].ptr;
                let _ = arena.attach(parent, child);
            }
            9 if !live.is_empty() => {
                let ptr = live[rng.gen_range(0..live.len())].ptr;
                if rng.gen_bool(0.5) {
                    arena.detach_from_parent(ptr);
                } else {
                    arena.detach_all_children(ptr);
                }
            }
            _ => {}
        }

        assert!(arena.get_verify(), "corrupted at step {step}");
        for entry in &live {
            assert!(arena.is_allocated(entry.ptr), "lost block at step {step}");
        }
    }

    for entry in &live {
        if arena.is_allocated(entry.ptr) {
            arena.release(entry.ptr);
        }
    }
    assert_eq!(arena.memory_used(), 0);
    assert_eq!(arena.report().fragments, 1);
}
