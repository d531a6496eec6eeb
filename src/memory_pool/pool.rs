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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::memory_pool::{MemoryPool, MemoryReclaimer, MemoryReservation};

fn update_peak(peak: &AtomicUsize, reserved: usize) {
    peak.fetch_max(reserved, Ordering::Relaxed);
}

/// A [`MemoryPool`] that enforces no limit. Tracks usage and the peak
/// but never refuses a grow and never arbitrates.
#[derive(Debug, Default)]
pub struct UnboundedMemoryPool {
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryPool for UnboundedMemoryPool {
    fn grow(&self, _reservation: &MemoryReservation, additional: usize) {
        let used = self.used.fetch_add(additional, Ordering::Relaxed);
        update_peak(&self.peak, used + additional);
    }

    fn shrink(&self, _reservation: &MemoryReservation, shrink: usize) {
        self.used.fetch_sub(shrink, Ordering::Relaxed);
    }

    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()> {
        self.grow(reservation, additional);
        Ok(())
    }

    fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn peak_reserved(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// A [`MemoryPool`] with a fixed limit and a built-in arbitrator.
///
/// When a `try_grow` cannot be satisfied from free capacity, the pool
/// first asks the *other* registered [`MemoryReclaimer`]s to give
/// memory back, then retries once. The requesting consumer is never
/// reclaimed from here: it is blocked inside this call, and its own
/// fallback on refusal is to spill itself.
///
/// `abort` poisons the pool and releases every registered reclaimer;
/// consumers observe the abort on their next operation.
pub struct ArbitratedMemoryPool {
    pool_size: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
    aborted: AtomicBool,
    reclaimers: Mutex<Vec<Weak<dyn MemoryReclaimer>>>,
}

impl std::fmt::Debug for ArbitratedMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbitratedMemoryPool")
            .field("pool_size", &self.pool_size)
            .field("used", &self.used.load(Ordering::Relaxed))
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

impl ArbitratedMemoryPool {
    /// Create a new pool that can hand out up to `pool_size` bytes.
    pub fn new(pool_size: usize) -> Self {
        debug!("Created new ArbitratedMemoryPool(pool_size={pool_size})");
        Self {
            pool_size,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            reclaimers: Mutex::new(Vec::new()),
        }
    }

    /// The configured limit in bytes.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn try_reserve(&self, additional: usize) -> Result<(), usize> {
        self.used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                let new_used = used + additional;
                (new_used <= self.pool_size).then_some(new_used)
            })
            .map(|used| update_peak(&self.peak, used + additional))
            .map_err(|used| self.pool_size.saturating_sub(used))
    }

    /// Ask reclaimers other than `requester` to free `target` bytes.
    fn reclaim_from_peers(&self, requester: &str, target: usize) -> usize {
        let reclaimers = self.upgrade_reclaimers();
        let mut freed = 0;
        for reclaimer in reclaimers {
            if freed >= target {
                break;
            }
            if reclaimer.name() == requester || !reclaimer.can_reclaim() {
                continue;
            }
            freed += reclaimer.reclaim(target - freed);
        }
        if freed > 0 {
            debug!("reclaimed {freed} bytes from peers of {requester}");
        }
        freed
    }

    /// Upgrade the registered handles, pruning the ones whose operator
    /// is gone.
    fn upgrade_reclaimers(&self) -> Vec<Arc<dyn MemoryReclaimer>> {
        let mut registered = self.reclaimers.lock();
        registered.retain(|weak| weak.strong_count() > 0);
        registered.iter().filter_map(Weak::upgrade).collect()
    }
}

impl MemoryPool for ArbitratedMemoryPool {
    fn grow(&self, _reservation: &MemoryReservation, additional: usize) {
        let used = self.used.fetch_add(additional, Ordering::Relaxed);
        update_peak(&self.peak, used + additional);
    }

    fn shrink(&self, _reservation: &MemoryReservation, shrink: usize) {
        self.used.fetch_sub(shrink, Ordering::Relaxed);
    }

    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()> {
        if self.try_reserve(additional).is_ok() {
            return Ok(());
        }
        // Insufficient free capacity: arbitrate among the peers of the
        // requester, then retry once.
        self.reclaim_from_peers(reservation.consumer().name(), additional);
        self.try_reserve(additional).map_err(|available| {
            insufficient_capacity_err(reservation, additional, available)
        })
    }

    fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn peak_reserved(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    fn register_reclaimer(&self, reclaimer: Weak<dyn MemoryReclaimer>) {
        self.reclaimers.lock().push(reclaimer);
    }

    fn reclaim(&self, target: usize) -> usize {
        let mut freed = 0;
        for reclaimer in self.upgrade_reclaimers() {
            if freed >= target {
                break;
            }
            if reclaimer.can_reclaim() {
                freed += reclaimer.reclaim(target - freed);
            }
        }
        freed
    }

    fn abort(&self, reason: &str) {
        warn!("aborting memory pool: {reason}");
        self.aborted.store(true, Ordering::SeqCst);
        for reclaimer in self.upgrade_reclaimers() {
            reclaimer.abort();
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

fn insufficient_capacity_err(
    reservation: &MemoryReservation,
    additional: usize,
    available: usize,
) -> Error {
    Error::ResourcesExhausted(format!(
        "Failed to allocate additional {} bytes for {} with {} bytes already \
         allocated for this reservation - {} bytes remain available for the total pool",
        additional,
        reservation.consumer().name(),
        reservation.size(),
        available
    ))
}
