// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! [`MemoryPool`] for tracking and limiting the memory used while
//! sorting, and the cooperative reclamation protocol between the pool's
//! arbitrator and spillable operators.
//!
//! Operators that buffer memory proportional to their input must
//! register a [`MemoryConsumer`] and grow the returned
//! [`MemoryReservation`] before allocating. A pool with a limit may
//! refuse the growth; a spillable operator then frees memory by
//! spilling its working set to disk and continues.
//!
//! The arbitrator side of the protocol is [`MemoryReclaimer`]: an
//! opaque handle registered with the pool through which memory can be
//! reclaimed from (or the query aborted on) an operator, from a thread
//! that merely observes it. The operator brackets the windows in which
//! this is allowed with [`ReclaimableSectionGuard`] and
//! [`NonReclaimableSectionGuard`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::Result;

mod pool;

pub use pool::*;

/// Tracks and potentially limits the memory used by registered
/// consumers.
///
/// `grow` and `shrink` are infallible bookkeeping; `try_grow` is the
/// gate that may refuse an allocation. A pool implementation is free to
/// satisfy a `try_grow` shortfall by reclaiming from other registered
/// consumers before refusing.
pub trait MemoryPool: Send + Sync + fmt::Debug {
    /// Registers a new [`MemoryConsumer`].
    fn register(&self, _consumer: &MemoryConsumer) {}

    /// Records the destruction of the [`MemoryReservation`] associated
    /// with a [`MemoryConsumer`].
    fn unregister(&self, _consumer: &MemoryConsumer) {}

    /// Infallibly grow the provided `reservation` by `additional`
    /// bytes. May overcommit the pool.
    fn grow(&self, reservation: &MemoryReservation, additional: usize);

    /// Infallibly shrink the provided `reservation` by `shrink` bytes.
    fn shrink(&self, reservation: &MemoryReservation, shrink: usize);

    /// Attempt to grow the provided `reservation` by `additional`
    /// bytes. On error the reservation is unchanged.
    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()>;

    /// Total bytes currently reserved across all consumers.
    fn reserved(&self) -> usize;

    /// High-water mark of [`Self::reserved`] over the pool's lifetime.
    fn peak_reserved(&self) -> usize {
        self.reserved()
    }

    /// Registers an operator-side reclamation handle. Pools without an
    /// arbitrator ignore it.
    fn register_reclaimer(&self, _reclaimer: Weak<dyn MemoryReclaimer>) {}

    /// Arbitrator entry point: reclaim up to `target` bytes from
    /// registered consumers. Returns the bytes actually freed.
    fn reclaim(&self, _target: usize) -> usize {
        0
    }

    /// Fails the query: all subsequent operations of registered
    /// consumers observe the abort and release their resources.
    fn abort(&self, _reason: &str) {}

    /// Whether [`Self::abort`] has been called.
    fn is_aborted(&self) -> bool {
        false
    }
}

/// The operator half of the cooperative reclamation cycle.
///
/// The pool holds a weak back-reference to drive reclaim; the operator
/// references the pool. Neither side owns the other.
pub trait MemoryReclaimer: Send + Sync {
    /// Name of the consumer this handle reclaims from.
    fn name(&self) -> &str;

    /// Whether reclamation would currently free anything.
    fn can_reclaim(&self) -> bool;

    /// Upper bound on the bytes a reclaim would free right now.
    fn reclaimable_bytes(&self) -> usize;

    /// Free up to `target_bytes` by spilling. Returns the bytes freed;
    /// 0 when reclamation is refused (wrong phase, non-reclaimable
    /// section, nothing buffered).
    fn reclaim(&self, target_bytes: usize) -> usize;

    /// Release all resources; the owning operator fails its next call.
    fn abort(&self);
}

/// A named allocation traced by a [`MemoryReservation`] in a
/// [`MemoryPool`].
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct MemoryConsumer {
    name: String,
    can_spill: bool,
}

impl MemoryConsumer {
    /// Create a new empty [`MemoryConsumer`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            can_spill: false,
        }
    }

    /// Set whether this consumer can free its allocation by spilling.
    pub fn with_can_spill(self, can_spill: bool) -> Self {
        Self { can_spill, ..self }
    }

    /// Whether this consumer can free its allocation by spilling.
    pub fn can_spill(&self) -> bool {
        self.can_spill
    }

    /// The name of this consumer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers this consumer with `pool`, returning an empty
    /// [`MemoryReservation`] to grow and shrink.
    pub fn register(self, pool: &Arc<dyn MemoryPool>) -> MemoryReservation {
        pool.register(&self);
        MemoryReservation {
            pool: Arc::clone(pool),
            consumer: self,
            size: 0,
        }
    }
}

/// An individual reservation of bytes in a [`MemoryPool`], freed back
/// to the pool on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<dyn MemoryPool>,
    consumer: MemoryConsumer,
    size: usize,
}

impl MemoryReservation {
    /// Size of this reservation in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The [`MemoryConsumer`] this reservation belongs to.
    pub fn consumer(&self) -> &MemoryConsumer {
        &self.consumer
    }

    /// Frees all bytes back to the pool, returning the number freed.
    pub fn free(&mut self) -> usize {
        let size = self.size;
        if size != 0 {
            self.shrink(size);
        }
        size
    }

    /// Frees `capacity` bytes back to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`Self::size`].
    pub fn shrink(&mut self, capacity: usize) {
        let new_size = self.size.checked_sub(capacity).unwrap();
        self.pool.shrink(self, capacity);
        self.size = new_size;
    }

    /// Infallibly grows the reservation by `capacity` bytes.
    pub fn grow(&mut self, capacity: usize) {
        self.pool.grow(self, capacity);
        self.size += capacity;
    }

    /// Tries to grow the reservation by `capacity` bytes, erroring if
    /// the pool refuses.
    pub fn try_grow(&mut self, capacity: usize) -> Result<()> {
        self.pool.try_grow(self, capacity)?;
        self.size += capacity;
        Ok(())
    }

    /// Infallibly sets the reservation to `capacity` bytes.
    pub fn resize(&mut self, capacity: usize) {
        use std::cmp::Ordering::*;
        match capacity.cmp(&self.size) {
            Greater => self.grow(capacity - self.size),
            Less => self.shrink(self.size - capacity),
            Equal => {}
        }
    }

    /// Tries to set the reservation to `capacity` bytes. Shrinking
    /// always succeeds.
    pub fn try_resize(&mut self, capacity: usize) -> Result<()> {
        use std::cmp::Ordering::*;
        match capacity.cmp(&self.size) {
            Greater => self.try_grow(capacity - self.size),
            Less => {
                self.shrink(self.size - capacity);
                Ok(())
            }
            Equal => Ok(()),
        }
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
        self.pool.unregister(&self.consumer);
    }
}

/// Scoped window in which the arbitrator is permitted to reclaim from
/// the operator owning `flag`.
///
/// `flag` is the operator's "non-reclaimable section" marker shared
/// with the arbitrator: entering clears it, exit restores the prior
/// value on all paths.
pub struct ReclaimableSectionGuard<'a> {
    flag: &'a AtomicBool,
    prior: bool,
}

impl<'a> ReclaimableSectionGuard<'a> {
    pub fn new(flag: &'a AtomicBool) -> Self {
        let prior = flag.swap(false, Ordering::SeqCst);
        Self { flag, prior }
    }
}

impl Drop for ReclaimableSectionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.prior, Ordering::SeqCst);
    }
}

/// The inverse of [`ReclaimableSectionGuard`]: marks the operator
/// non-reclaimable for the scope, restoring the prior value on exit.
pub struct NonReclaimableSectionGuard<'a> {
    flag: &'a AtomicBool,
    prior: bool,
}

impl<'a> NonReclaimableSectionGuard<'a> {
    pub fn new(flag: &'a AtomicBool) -> Self {
        let prior = flag.swap(true, Ordering::SeqCst);
        Self { flag, prior }
    }
}

impl Drop for NonReclaimableSectionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.prior, Ordering::SeqCst);
    }
}

/// Present size in human readable form.
pub fn human_readable_size(size: usize) -> String {
    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;

    let size = size as u64;
    let (value, unit) = if size >= 2 * GB {
        (size as f64 / GB as f64, "GB")
    } else if size >= 2 * MB {
        (size as f64 / MB as f64, "MB")
    } else if size >= 2 * KB {
        (size as f64 / KB as f64, "KB")
    } else {
        (size as f64, "B")
    };
    format!("{value:.1} {unit}")
}
