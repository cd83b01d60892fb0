//! Randomized make/verify/release across many threads.
//!
//! Each thread owns an array of `RefT<Thing>` slots and, at random, builds a
//! new `Thing` into a slot, copies another slot, verifies a slot, or releases
//! one. Every `Thing` lives in one shared allocator, so any double hand-out
//! or stray write corrupts a canary.

mod common;

use common::thing::{self, Tally, Thing};
use rand::Rng;
use slabref::{Ref, RefT};
use std::sync::Arc;
use std::thread;

const THREADS: u64 = 8;
const SLOTS: usize = 64;
const OPERATIONS: usize = 20_000;

#[test]
#[cfg_attr(miri, ignore)]
fn random_make_check_release() {
    common::init_tracing();
    let pool = thing::pool(256, 128);
    let tally = Tally::new();

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let pool = pool.clone();
            let tally = tally.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                let mut slots: Vec<RefT<Thing>> = (0..SLOTS).map(|_| RefT::empty()).collect();
                let mut serial = tid << 40;

                for _ in 0..OPERATIONS {
                    let index = rng.random_range(0..SLOTS);
                    match rng.random_range(0..10) {
                        0..=3 => {
                            serial += 1;
                            slots[index] = thing::make(&pool, serial, &tally);
                        }
                        4..=5 => {
                            let from = rng.random_range(0..SLOTS);
                            let copy = slots[from].clone();
                            slots[index].set(&copy).unwrap();
                        }
                        6..=8 => {
                            if let Some(thing) = slots[index].get() {
                                thing.verify();
                            }
                        }
                        _ => slots[index].clear(),
                    }
                }

                for slot in &slots {
                    if let Some(thing) = slot.get() {
                        thing.verify();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(Ref::gc());
    Ref::debug_static();
    pool.debug();

    assert_eq!(tally.errors(), 0, "canary mismatches");
    assert_eq!(tally.constructed(), tally.destroyed());
    let stats = pool.stats();
    assert_eq!(stats.gets, stats.puts);
    assert_eq!(stats.gets, tally.constructed());
    pool.check().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn shared_slots_across_threads() {
    let pool = thing::pool(64, 64);
    let tally = Tally::new();
    let board: Arc<Vec<parking_lot::Mutex<RefT<Thing>>>> = Arc::new(
        (0..SLOTS)
            .map(|n| parking_lot::Mutex::new(thing::make(&pool, n as u64, &tally)))
            .collect(),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let board = board.clone();
            let pool = pool.clone();
            let tally = tally.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                for n in 0..OPERATIONS / 4 {
                    let a = rng.random_range(0..SLOTS);
                    let held = board[a].lock().clone();
                    if let Ok(thing) = held.target() {
                        thing.verify();
                    }
                    if rng.random_bool(0.3) {
                        let b = rng.random_range(0..SLOTS);
                        *board[b].lock() = thing::make(&pool, tid << 40 | n as u64, &tally);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    drop(board);

    assert!(Ref::gc());
    assert_eq!(tally.errors(), 0);
    assert_eq!(tally.constructed(), tally.destroyed());
    pool.check().unwrap();
}
