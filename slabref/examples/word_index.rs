//! Word index shared between threads through `Ref`s.
//!
//! Worker threads split a text, build one `Entry` per word in a shared slab
//! allocator, and publish them into a latched table. Entries replaced in the
//! table are collected once no thread refers to them any more.
//!
//! Run with `RUST_LOG=slabref=debug` to see the allocator and collector dumps.

use slabref::{Allocator, Latched, Object, Ref, RefT, Result, compare_cast};
use std::cmp::Ordering;
use std::sync::Arc;
use std::thread;

const TEXT: &str = "the quick brown fox jumps over the lazy dog while the cat \
    watches the fox and the dog sleeps under the brown tree";

struct Entry {
    word: &'static str,
    position: usize,
}

impl Object for Entry {
    fn compare(&self, other: &dyn Object) -> Result<Ordering> {
        let other = compare_cast::<Entry>(other)?;
        Ok(self.word.cmp(other.word).then(self.position.cmp(&other.position)))
    }

    fn string(&self) -> String {
        format!("{}@{}", self.word, self.position)
    }
}

/// Last occurrence of each word, keyed by bucket.
struct Table {
    buckets: Latched<Vec<Ref>>,
}

impl Table {
    fn new(size: usize) -> Self {
        Self {
            buckets: Latched::new((0..size).map(|_| Ref::new()).collect()),
        }
    }

    fn publish(&self, entry: &RefT<Entry>) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let bucket = entry.target()?.word.len() % buckets.len();
        buckets[bucket].set(&Ref::from(entry))
    }

    fn dump(&self) {
        for (index, slot) in self.buckets.lock().iter().enumerate() {
            println!("bucket {index:2}: {slot:?} refs={:?}", slot.references());
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let pool = Arc::new(Allocator::new(RefT::<Entry>::NODE_SIZE, 32, 64)?);
    let table = Arc::new(Table::new(8));
    let words: Vec<&'static str> = TEXT.split_whitespace().collect();

    let handles: Vec<_> = words
        .chunks(words.len().div_ceil(4))
        .enumerate()
        .map(|(chunk, part)| {
            let pool = pool.clone();
            let table = table.clone();
            let base = chunk * words.len().div_ceil(4);
            let part = part.to_vec();
            thread::spawn(move || -> Result<()> {
                for (offset, word) in part.into_iter().enumerate() {
                    let entry = RefT::new_in(
                        Entry {
                            word,
                            position: base + offset,
                        },
                        &pool,
                    )?;
                    table.publish(&entry)?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker panicked")?;
    }

    table.dump();
    Ref::gc();
    println!(
        "live objects: {}, allocator: {:?}",
        Ref::object_count(),
        pool.stats()
    );
    pool.debug();
    Allocator::debug_static();
    Ref::debug_static();
    pool.check()
}
