// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Bounded dispatch of mining subprocesses. The in-progress set keeps one
//! subprocess per (address, challenge) pair; the expiry scan guarantees that
//! no in-flight work survives past its challenge's submission window.

use hiveminer_logging::macros::*;

use crate::halt;
use crate::work::WorkItem;

use chrono::{DateTime, Utc};
use futures::lock::Mutex;

use std::collections::HashMap;

/// Tracking record of one running miner subprocess
struct InFlight {
    challenge_id: String,
    expires_at: DateTime<Utc>,
    abort: halt::Sender,
}

struct PoolInner {
    in_progress: HashMap<String, InFlight>,
}

/// Slot accounting for up to `capacity` concurrent miner subprocesses
pub struct Pool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BUG: pool capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(PoolInner {
                in_progress: HashMap::new(),
            }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.in_progress.len()
    }

    pub async fn is_idle(&self) -> bool {
        self.len().await == 0
    }

    /// Atomically take a slot for `item`. Returns the abort receiver for the
    /// subprocess, or `None` when the pool is full or the item is already
    /// being mined.
    pub async fn try_claim(&self, item: &WorkItem) -> Option<halt::Receiver> {
        let mut inner = self.inner.lock().await;
        if inner.in_progress.len() >= self.capacity {
            return None;
        }
        let key = item.key();
        if inner.in_progress.contains_key(&key) {
            return None;
        }
        let (abort_sender, abort_receiver) = halt::make_pair();
        inner.in_progress.insert(
            key,
            InFlight {
                challenge_id: item.challenge.challenge_id.clone(),
                expires_at: item.challenge.latest_submission,
                abort: abort_sender,
            },
        );
        Some(abort_receiver)
    }

    /// Give the slot back; a no-op when the expiry scan already dropped it
    pub async fn release(&self, key: &str) {
        self.inner.lock().await.in_progress.remove(key);
    }

    /// Abort every subprocess whose challenge can no longer be submitted.
    /// Returns the released item keys.
    pub async fn abort_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .in_progress
            .iter()
            .filter(|(_, tracked)| tracked.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(tracked) = inner.in_progress.remove(key) {
                info!(
                    "Dispatch: aborting {} (challenge {} expired)",
                    key, tracked.challenge_id
                );
                tracked.abort.stop();
            }
        }
        expired
    }

    /// Signal every subprocess to stop; used on worker shutdown. Slots are
    /// freed by the owning tasks as the subprocesses actually exit, so an
    /// idle pool means the wind-down is complete.
    pub async fn abort_all(&self) {
        let inner = self.inner.lock().await;
        for (key, tracked) in inner.in_progress.iter() {
            debug!("Dispatch: aborting {} on shutdown", key);
            tracked.abort.stop();
        }
    }
}
