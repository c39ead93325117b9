//! Allocation of small connection identifiers.
//!
//! Ids come from a shuffled array with a cursor, so `assign` is O(1). A
//! recycled id is not handed out again straight away: it waits until the
//! assignable part of the array runs dry, at which point one `collate` pass
//! rebuilds the array from every unused id. That keeps the O(n) rebuild rare
//! and makes reuse order unpredictable.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::types::{CryptoTcpError, Result};

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub using: usize,
    pub recycled: usize,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<u32>,
    in_use: Vec<bool>,
    available: usize,
    using: usize,
    recycled: usize,
    cursor: usize,
}

/// Thread-safe id pool over `[0, capacity)`.
#[derive(Debug)]
pub struct IdPool {
    state: Mutex<PoolState>,
}

impl IdPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots: Vec<u32> = (0..capacity as u32).collect();
        shuffle(&mut slots);
        Self {
            state: Mutex::new(PoolState {
                slots,
                in_use: vec![false; capacity],
                available: capacity,
                using: 0,
                recycled: 0,
                cursor: 0,
            }),
        }
    }

    /// Take an unused id, collating recycled ids back in when needed.
    pub fn assign(&self) -> Result<u32> {
        let mut state = self.state.lock();
        if state.available == 0 {
            if state.recycled == 0 {
                return Err(CryptoTcpError::PoolExhausted);
            }
            state.collate();
        }
        let id = state.slots[state.cursor];
        state.in_use[id as usize] = true;
        state.cursor += 1;
        state.available -= 1;
        state.using += 1;
        Ok(id)
    }

    /// Give an id back. It becomes assignable after the next collate.
    pub fn recycle(&self, id: u32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.in_use.get_mut(id as usize) {
            Some(used) if *used => {
                *used = false;
                state.recycled += 1;
                state.using -= 1;
            }
            _ => warn!("Ignoring recycle of id {} that is not in use", id),
        }
    }

    pub fn using(&self) -> usize {
        self.state.lock().using
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: state.in_use.len(),
            available: state.available,
            using: state.using,
            recycled: state.recycled,
        }
    }
}

impl PoolState {
    fn collate(&mut self) {
        let mut n = 0;
        for id in 0..self.in_use.len() {
            if !self.in_use[id] {
                self.slots[n] = id as u32;
                n += 1;
            }
        }
        debug!("Collated id pool: {} available, {} recycled", n, self.recycled);
        self.available = n;
        self.recycled = 0;
        self.cursor = 0;
        shuffle(&mut self.slots[..n]);
    }
}

fn shuffle(slots: &mut [u32]) {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    slots.shuffle(&mut StdRng::seed_from_u64(seed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn assert_accounting(pool: &IdPool) {
        let s = pool.stats();
        assert_eq!(s.available + s.using + s.recycled, s.capacity, "{:?}", s);
    }

    #[test]
    fn test_assign_unique_then_exhausted() {
        let pool = IdPool::new(100);
        let ids: HashSet<u32> = (0..100).map(|_| pool.assign().unwrap()).collect();
        assert_eq!(ids, (0..100).collect());
        assert!(matches!(pool.assign(), Err(CryptoTcpError::PoolExhausted)));
        assert_accounting(&pool);
    }

    #[test]
    fn test_recycle_all_and_reassign() {
        let pool = IdPool::new(64);
        let first: Vec<u32> = (0..64).map(|_| pool.assign().unwrap()).collect();
        for id in &first {
            pool.recycle(*id);
        }
        assert_eq!(pool.stats().recycled, 64);
        assert_accounting(&pool);

        let second: Vec<u32> = (0..64).map(|_| pool.assign().unwrap()).collect();
        let a: HashSet<u32> = first.into_iter().collect();
        let b: HashSet<u32> = second.iter().copied().collect();
        assert_eq!(b.len(), 64);
        assert_eq!(a, b);
        assert!(matches!(pool.assign(), Err(CryptoTcpError::PoolExhausted)));
    }

    #[test]
    fn test_recycled_id_waits_for_collate() {
        let pool = IdPool::new(4);
        let first = pool.assign().unwrap();
        pool.recycle(first);
        // Three fresh ids remain; none of them may be the recycled one.
        let fresh: Vec<u32> = (0..3).map(|_| pool.assign().unwrap()).collect();
        assert!(!fresh.contains(&first));
        assert_accounting(&pool);
        // Only now does the recycled id come back.
        assert_eq!(pool.assign().unwrap(), first);
        assert_eq!(pool.stats().recycled, 0);
    }

    #[test]
    fn test_never_assigns_live_id() {
        let pool = IdPool::new(8);
        let mut live: HashSet<u32> = HashSet::new();
        for round in 0..200u32 {
            if round % 3 == 2 {
                if let Some(id) = live.iter().next().copied() {
                    live.remove(&id);
                    pool.recycle(id);
                }
            }
            match pool.assign() {
                Ok(id) => assert!(live.insert(id), "id {} handed out twice", id),
                Err(CryptoTcpError::PoolExhausted) => assert_eq!(live.len(), 8),
                Err(e) => panic!("unexpected error: {}", e),
            }
            assert_accounting(&pool);
        }
    }

    #[test]
    fn test_bogus_recycle_ignored() {
        let pool = IdPool::new(2);
        let id = pool.assign().unwrap();
        pool.recycle(99);
        pool.recycle(1 - id);
        assert_eq!(pool.using(), 1);
        pool.recycle(id);
        pool.recycle(id);
        assert_eq!(pool.stats().recycled, 1);
        assert_accounting(&pool);
    }

    #[test]
    fn test_concurrent_assign() {
        let pool = Arc::new(IdPool::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..125).map(|_| pool.assign().unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 1000);
        assert_eq!(pool.using(), 1000);
    }
}
