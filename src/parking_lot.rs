//! Address-keyed waiter registry behind `memory.atomic.wait` and `memory.atomic.notify`.
//!
//! Waiters are keyed by the identity of the shared memory they wait on and the byte address
//! inside it. A waiter validates its expected value and enqueues itself under one lock, so
//! a notify that races with a wait is never lost. Once enqueued it spins with a capped backoff
//! until a notifier flags it or its deadline passes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use nohash_hasher::IntMap;

use crate::memory::SharedMemory;

const MAX_SPIN: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    Mismatch,
    TimedOut,
}

impl WaitOutcome {
    /// The value `memory.atomic.wait` pushes.
    pub fn code(self) -> i32 {
        match self {
            WaitOutcome::Woken => 0,
            WaitOutcome::Mismatch => 1,
            WaitOutcome::TimedOut => 2,
        }
    }
}

/// A wait location: which shared memory, and where in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkingKey {
    pub memory: usize,
    pub address: u64,
}

impl ParkingKey {
    pub fn new(memory: &Arc<SharedMemory>, address: u64) -> Self {
        ParkingKey { memory: Arc::as_ptr(memory) as usize, address }
    }
}

type Queues = IntMap<usize, IntMap<u64, VecDeque<Arc<Waiter>>>>;

#[derive(Default)]
struct Waiter {
    woken: AtomicBool,
}

#[derive(Default)]
pub struct AtomicParkingLot {
    queues: Mutex<Queues>,
}

impl AtomicParkingLot {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Parks the calling thread on `key` if `validate` holds while the registry lock is held.
    pub fn park_conditionally(
        &self,
        key: ParkingKey,
        validate: impl FnOnce() -> bool,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        let waiter = Arc::new(Waiter::default());
        {
            let mut queues = self.lock();
            if !validate() {
                return WaitOutcome::Mismatch;
            }
            queues.entry(key.memory).or_default().entry(key.address).or_default().push_back(waiter.clone());
        }

        let mut spin = 1u32;
        while !waiter.woken.load(Ordering::Acquire) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let mut queues = self.lock();
                // A notifier may have taken us between the check and the lock.
                if waiter.woken.load(Ordering::Acquire) {
                    return WaitOutcome::Woken;
                }
                if let Some(queue) = queue_mut(&mut queues, key) {
                    queue.retain(|w| !Arc::ptr_eq(w, &waiter));
                }
                prune(&mut queues, key);
                return WaitOutcome::TimedOut;
            }
            if spin < MAX_SPIN {
                for _ in 0..spin {
                    std::hint::spin_loop();
                }
                spin *= 2;
            } else {
                std::thread::yield_now();
            }
        }
        WaitOutcome::Woken
    }

    /// Wakes up to `count` waiters on `key`, oldest first. Returns how many woke.
    pub fn unpark(&self, key: ParkingKey, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }
        let mut queues = self.lock();
        let Some(queue) = queue_mut(&mut queues, key) else { return 0 };
        let n = queue.len().min(count as usize);
        for waiter in queue.drain(..n) {
            waiter.woken.store(true, Ordering::Release);
        }
        prune(&mut queues, key);
        n as u32
    }

    pub fn waiter_count(&self, key: ParkingKey) -> usize {
        self.lock().get(&key.memory).and_then(|m| m.get(&key.address)).map_or(0, VecDeque::len)
    }
}

fn queue_mut(queues: &mut Queues, key: ParkingKey) -> Option<&mut VecDeque<Arc<Waiter>>> {
    queues.get_mut(&key.memory)?.get_mut(&key.address)
}

fn prune(queues: &mut Queues, key: ParkingKey) {
    if let Some(addresses) = queues.get_mut(&key.memory) {
        if addresses.get(&key.address).is_some_and(VecDeque::is_empty) {
            addresses.remove(&key.address);
        }
        if addresses.is_empty() {
            queues.remove(&key.memory);
        }
    }
}
