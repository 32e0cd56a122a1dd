//! Coarse-grained engine clock.
//!
//! An [`Epoch`] is a 32-bit wrap-aware counter. Every committed transaction
//! carries one, and the engine maintains three global values:
//!
//! - **current**: writers issue commit ids into this epoch.
//! - **grace**: `current - 1`; everything in or before it is safe to read.
//! - **durable**: all redo logs up to here are fsynced (owned by the log
//!   manager).
//!
//! Zero is reserved as the invalid epoch, so the wrap sequence skips it:
//! `u32::MAX` is followed by 1. Comparisons assume the two values are
//! within half the ring of each other, which the engine guarantees by
//! advancing one grain at a time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// A wrap-aware epoch value. `Epoch::default()` is the invalid epoch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Epoch(u32);

impl Epoch {
    /// The reserved invalid value.
    pub const INVALID: Epoch = Epoch(0);
    /// The first valid epoch after engine creation.
    pub const INITIAL: Epoch = Epoch(1);

    /// Construct from a raw u32. Zero yields the invalid epoch.
    pub const fn from_raw(raw: u32) -> Epoch {
        Epoch(raw)
    }

    /// Raw u32 representation.
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Whether this is a usable epoch value.
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// The epoch one grain later, skipping the invalid value on wrap.
    pub fn one_more(&self) -> Epoch {
        let next = self.0.wrapping_add(1);
        if next == 0 {
            Epoch(1)
        } else {
            Epoch(next)
        }
    }

    /// The epoch one grain earlier. Returns the invalid epoch when called
    /// on the initial epoch.
    pub fn one_less(&self) -> Epoch {
        debug_assert!(self.is_valid());
        let prev = self.0.wrapping_sub(1);
        Epoch(prev)
    }

    /// Wrap-aware strict "before" relation. Both sides must be valid.
    pub fn before(&self, other: Epoch) -> bool {
        debug_assert!(self.is_valid());
        debug_assert!(other.is_valid());
        let diff = other.0.wrapping_sub(self.0);
        diff != 0 && diff < (1u32 << 31)
    }

    /// `self` is the same as or before `other`.
    pub fn before_or_equal(&self, other: Epoch) -> bool {
        *self == other || self.before(other)
    }

    /// Keep the later of the two values. The invalid epoch loses to any
    /// valid one.
    pub fn store_max(&mut self, other: Epoch) {
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() || self.before(other) {
            *self = other;
        }
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Epoch({})", self.0)
        } else {
            write!(f, "Epoch(invalid)")
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An epoch published across threads with release stores and acquire loads.
#[derive(Debug)]
pub struct AtomicEpoch(AtomicU32);

impl AtomicEpoch {
    /// Create with an initial value.
    pub fn new(epoch: Epoch) -> AtomicEpoch {
        AtomicEpoch(AtomicU32::new(epoch.raw()))
    }

    /// Acquire-load the published value.
    pub fn load(&self) -> Epoch {
        Epoch::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Release-store a new value.
    pub fn store(&self, epoch: Epoch) {
        self.0.store(epoch.raw(), Ordering::Release);
    }

    /// Advance to the next grain, returning the new value.
    ///
    /// Single-advancer discipline: only the epoch chime (or a test standing
    /// in for it) calls this, so a load-then-store pair is sufficient.
    pub fn advance(&self) -> Epoch {
        let next = self.load().one_more();
        self.store(next);
        next
    }

    /// Monotone maximum under concurrent stores.
    pub fn store_max(&self, epoch: Epoch) {
        if !epoch.is_valid() {
            return;
        }
        let mut observed = self.load();
        loop {
            if observed.is_valid() && !observed.before(epoch) {
                return;
            }
            match self.0.compare_exchange(
                observed.raw(),
                epoch.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(raw) => observed = Epoch::from_raw(raw),
            }
        }
    }
}
