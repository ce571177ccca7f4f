// Copyright 2026 Stratus Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fetch coalescing lock
//!
//! At most one concurrent remote fetch per segment key: the first caller of
//! a missing segment gets the fetch permit, same-key callers get a wait
//! handle and re-check the cache once the fetcher finishes.

use crate::key::SegmentKey;

use log::warn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::IntoStaticStr;
use tokio::sync::Semaphore;
use tokio::time::timeout;

/// Status which the waiters could possibly see
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum LockStatus {
    /// Waiting for the fetcher to finish
    Waiting,
    /// The fetcher finished and retained the segment, waiters re-check the cache
    Done,
    /// The fetcher encountered an error. A new fetcher will be elected.
    TransientError,
    /// The fetcher observed that the segment cannot be retained locally,
    /// waiters should fetch independently without a new fetch lock
    GiveUp,
    /// The fetch permit is dropped without being released
    Dangling,
    /// The lock is held for too long
    Timeout,
}

impl From<LockStatus> for u8 {
    fn from(l: LockStatus) -> u8 {
        match l {
            LockStatus::Waiting => 0,
            LockStatus::Done => 1,
            LockStatus::TransientError => 2,
            LockStatus::GiveUp => 3,
            LockStatus::Dangling => 4,
            LockStatus::Timeout => 5,
        }
    }
}

impl From<u8> for LockStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Waiting,
            1 => Self::Done,
            2 => Self::TransientError,
            3 => Self::GiveUp,
            4 => Self::Dangling,
            5 => Self::Timeout,
            _ => Self::GiveUp, // placeholder
        }
    }
}

#[derive(Debug)]
struct LockCore {
    lock_start: Instant,
    age_timeout: Duration,
    lock: Semaphore,
    // use u8 for Atomic enum
    lock_status: AtomicU8,
}

impl LockCore {
    fn new_arc(age_timeout: Duration) -> Arc<Self> {
        Arc::new(LockCore {
            lock: Semaphore::new(0),
            age_timeout,
            lock_start: Instant::now(),
            lock_status: AtomicU8::new(LockStatus::Waiting.into()),
        })
    }

    fn locked(&self) -> bool {
        self.lock.available_permits() == 0
    }

    fn unlock(&self, reason: LockStatus) {
        self.lock_status.store(reason.into(), Ordering::SeqCst);
        // Any small positive number will do, 10 is used for RwLock as well.
        // No need to wake up all at once.
        self.lock.add_permits(10);
    }

    fn lock_status(&self) -> LockStatus {
        self.lock_status.load(Ordering::SeqCst).into()
    }
}

// all 3 structs below are just Arc<LockCore> with different interfaces

/// WaitHandle: the callers who get it wait until the fetcher releases the lock
#[derive(Debug)]
pub struct WaitHandle(Arc<LockCore>);

impl WaitHandle {
    /// Wait for the fetcher to release the lock
    pub async fn wait(&self) {
        if !self.locked() {
            return;
        }
        if let Some(duration) = self.0.age_timeout.checked_sub(self.0.lock_start.elapsed()) {
            match timeout(duration, self.0.lock.acquire()).await {
                Ok(Ok(_)) => { // permit is returned to the Semaphore right away
                }
                Ok(Err(e)) => {
                    warn!("error acquiring semaphore {e:?}")
                }
                Err(_) => {
                    self.0
                        .lock_status
                        .store(LockStatus::Timeout.into(), Ordering::SeqCst);
                }
            }
        } else {
            // expiration has already occurred, store timeout status
            self.0
                .lock_status
                .store(LockStatus::Timeout.into(), Ordering::SeqCst);
        }
    }

    /// Test if it is still locked
    pub fn locked(&self) -> bool {
        self.0.locked()
    }

    /// Whether the lock is expired, e.g., the fetcher has been holding it for too long
    pub fn expired(&self) -> bool {
        // NOTE: this is whether the lock is currently expired,
        // not whether it was timed out during wait()
        self.0.lock_start.elapsed() >= self.0.age_timeout
    }

    /// The current status of the lock
    pub fn lock_status(&self) -> LockStatus {
        let status = self.0.lock_status();
        if matches!(status, LockStatus::Waiting) && self.expired() {
            LockStatus::Timeout
        } else {
            status
        }
    }
}

/// FetchPermit: the caller who gets it performs the fetch and then releases it
#[derive(Debug)]
pub struct FetchPermit {
    lock: Arc<LockCore>,
    finished: bool,
}

impl FetchPermit {
    fn new(age_timeout: Duration) -> (FetchPermit, LockStub) {
        let lock = LockCore::new_arc(age_timeout);
        let stub = LockStub(lock.clone());
        (
            FetchPermit {
                lock,
                finished: false,
            },
            stub,
        )
    }

    fn unlock(&mut self, reason: LockStatus) {
        self.finished = true;
        self.lock.unlock(reason);
    }

    /// The current status of the lock
    pub fn lock_status(&self) -> LockStatus {
        self.lock.lock_status()
    }
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        // the fetcher exited without releasing, let others compete for the permit again
        if !self.finished {
            debug_assert!(false, "dangling fetch lock started");
            self.unlock(LockStatus::Dangling);
        }
    }
}

#[derive(Debug)]
struct LockStub(Arc<LockCore>);

impl LockStub {
    fn wait_handle(&self) -> WaitHandle {
        WaitHandle(self.0.clone())
    }
}

/// The result of competing for a key's fetch lock
#[derive(Debug)]
pub enum Locked {
    /// This caller fetches the segment
    Fetch(FetchPermit),
    /// Another caller is already fetching, wait for its outcome
    Wait(WaitHandle),
}

impl Locked {
    /// Is this the fetch permit
    pub fn is_fetch(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}

/// The per-key fetch lock table
#[derive(Debug)]
pub struct FetchLock {
    lock_table: RwLock<HashMap<u128, LockStub>>,
    // fixed lock timeout value for now
    age_timeout: Duration,
}

impl FetchLock {
    /// Create a new [FetchLock].
    ///
    /// `age_timeout` bounds how long a fetcher may hold a permit before the
    /// waiters give up on it and compete for the permit themselves.
    pub fn new(age_timeout: Duration) -> Self {
        FetchLock {
            lock_table: RwLock::new(HashMap::new()),
            age_timeout,
        }
    }

    /// Compete for the fetch lock of `key`.
    ///
    /// Call after a cache miss, before fetching. The returned [Locked] tells
    /// the caller either to fetch or to wait.
    pub fn lock(&self, key: &SegmentKey) -> Locked {
        let key = key.as_u128();
        {
            let table = self.lock_table.read();
            if let Some(lock) = table.get(&key) {
                // already has an ongoing fetch
                // A Dangling or Timeout lock remains in the table and callers
                // should attempt to replace it; any waiters parked on it have
                // timed out or are about to on their own.
                if !matches!(
                    lock.0.lock_status(),
                    LockStatus::Dangling | LockStatus::Timeout
                ) {
                    return Locked::Wait(lock.wait_handle());
                }
            }
        }

        let mut table = self.lock_table.write();
        // check again in case another caller already added it
        if let Some(lock) = table.get(&key) {
            if !matches!(
                lock.0.lock_status(),
                LockStatus::Dangling | LockStatus::Timeout
            ) {
                return Locked::Wait(lock.wait_handle());
            }
        }
        let (permit, stub) = FetchPermit::new(self.age_timeout);
        table.insert(key, stub);
        Locked::Fetch(permit)
    }

    /// Release the fetch lock for `key`
    pub fn release(&self, key: &SegmentKey, mut permit: FetchPermit, reason: LockStatus) {
        let key = key.as_u128();
        if permit.lock.lock_status() == LockStatus::Timeout {
            // the lock aged out, so other callers are free to replace the
            // table entry associated with this permit; keep the Timeout
            // status since the entry is not removed here
            permit.unlock(LockStatus::Timeout);
        } else if self.lock_table.write().remove(&key).is_some() {
            permit.unlock(reason);
        }
        // the situations above should capture all possible options,
        // else a dangling fetch lock may start
    }
}
