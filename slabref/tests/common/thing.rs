//! `Thing`: a self-checking payload.
//!
//! Every `Thing` records its own address twice (`pos == addr`,
//! `neg == !addr`) between two fixed validator words, plus a check word
//! derived from its serial number. Any stray write into its storage, or
//! storage handed to two holders at once, shows up as a mismatch in
//! [`Thing::verify`] or when the `Thing` is dropped.

use slabref::{Allocator, Object, RefT, Result, compare_cast};
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const PREFIX: u64 = 0x5052_4546_4958_3a3a;
const SUFFIX: u64 = 0x3a3a_5355_4646_4958;
const CHECK_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// Lifecycle counters for one population of `Thing`s.
#[derive(Debug, Default)]
pub struct Tally {
    pub constructed: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub errors: AtomicUsize,
}

impl Tally {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Thing {
    prefix: u64,
    pos: usize,
    neg: usize,
    serial: u64,
    check: u64,
    suffix: u64,
    tally: Arc<Tally>,
}

fn check_word(serial: u64, addr: usize) -> u64 {
    serial.rotate_left(17) ^ addr as u64 ^ CHECK_SALT
}

impl Thing {
    /// A `Thing` that will live at `addr`.
    pub fn new(addr: usize, serial: u64, tally: Arc<Tally>) -> Self {
        tally.constructed.fetch_add(1, Ordering::SeqCst);
        Self {
            prefix: PREFIX,
            pos: addr,
            neg: !addr,
            serial,
            check: check_word(serial, addr),
            suffix: SUFFIX,
            tally,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Validate every canary; a mismatch is counted in the tally.
    pub fn verify(&self) -> bool {
        let addr = self as *const Self as usize;
        let ok = self.prefix == PREFIX
            && self.suffix == SUFFIX
            && self.pos == addr
            && self.neg == !addr
            && self.check == check_word(self.serial, addr);
        if !ok {
            self.tally.errors.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }
}

impl Drop for Thing {
    fn drop(&mut self) {
        self.verify();
        self.prefix = 0;
        self.suffix = 0;
        self.tally.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Object for Thing {
    fn compare(&self, other: &dyn Object) -> Result<CmpOrdering> {
        Ok(self.serial.cmp(&compare_cast::<Thing>(other)?.serial))
    }

    fn hashf(&self) -> u64 {
        self.serial
    }

    fn string(&self) -> String {
        format!("Thing#{}@{:#x}", self.serial, self.pos)
    }
}

/// A pool sized for `Thing` nodes.
pub fn pool(reserved: usize, extended: usize) -> Arc<Allocator> {
    Arc::new(Allocator::new(RefT::<Thing>::NODE_SIZE, reserved, extended).unwrap())
}

/// Build a `Thing` in `pool`, stamped with the address it lives at.
pub fn make(pool: &Arc<Allocator>, serial: u64, tally: &Arc<Tally>) -> RefT<Thing> {
    RefT::build_in(pool, |addr| Thing::new(addr, serial, tally.clone())).unwrap()
}
