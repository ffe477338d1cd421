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

//! Durable address assignment ledger. Every mutation goes through a
//! read-modify-write loop backed by the object store's conditional writes;
//! the registry object is never blind-written.

use hiveminer_logging::macros::*;

use crate::backoff::Backoff;
use crate::error::{self, ErrorKind};
use crate::hal::{CasOutcome, Clock, ObjectStore, Precondition};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::sync::Arc;

/// Registry object key within the regional bucket
pub const REGISTRY_KEY: &str = "registry.json";

/// Conditional-write attempts on the allocator path where a caller is waiting
pub const ALLOCATOR_CAS_ATTEMPTS: u32 = 10;

/// Conditional-write attempts on the reclaimer path which can afford patience
pub const RECLAIMER_CAS_ATTEMPTS: u32 = 60;

/// A contiguous address range bound to one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_endpoint: Option<String>,
    pub start_address: usize,
    pub end_address: usize,
    /// Cached address slice so workers need not re-index the master list
    pub addresses: Vec<String>,
    pub assigned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Assignment {
    /// Most recent sign of life; a fresh assignment counts as one
    pub fn freshness(&self) -> DateTime<Utc> {
        match self.last_heartbeat {
            Some(heartbeat) => heartbeat.max(self.assigned_at),
            None => self.assigned_at,
        }
    }
}

/// The `registry.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Full ordered address set; immutable once seeded
    pub addresses: Vec<String>,
    /// Cursor into `addresses`; never lowered by reclamation (holes are skipped)
    pub next_available: usize,
    pub assignments: HashMap<String, Assignment>,
    pub addresses_per_instance: usize,
}

impl Registry {
    pub fn new(addresses: Vec<String>, addresses_per_instance: usize) -> Self {
        Self {
            addresses,
            next_available: 0,
            assignments: HashMap::new(),
            addresses_per_instance,
        }
    }

    /// Check the structural invariants: every live range is a sub-interval of
    /// `[0, len)`, live ranges are pairwise disjoint and the cursor lies past
    /// the highest live range.
    pub fn validate(&self) -> error::Result<()> {
        if self.addresses_per_instance == 0 {
            return Err(ErrorKind::RegistryInvalid(
                "addressesPerInstance must be positive".to_string(),
            ))?;
        }
        if self.next_available > self.addresses.len() {
            return Err(ErrorKind::RegistryInvalid(format!(
                "nextAvailable {} exceeds address count {}",
                self.next_available,
                self.addresses.len()
            )))?;
        }

        let mut ranges: Vec<(usize, usize, &str)> = Vec::with_capacity(self.assignments.len());
        for (worker_id, assignment) in &self.assignments {
            if assignment.start_address > assignment.end_address
                || assignment.end_address >= self.addresses.len()
            {
                return Err(ErrorKind::RegistryInvalid(format!(
                    "assignment of {} covers [{}, {}] outside of [0, {})",
                    worker_id,
                    assignment.start_address,
                    assignment.end_address,
                    self.addresses.len()
                )))?;
            }
            if assignment.end_address >= self.next_available {
                return Err(ErrorKind::RegistryInvalid(format!(
                    "assignment of {} ends at {} but nextAvailable is {}",
                    worker_id, assignment.end_address, self.next_available
                )))?;
            }
            ranges.push((assignment.start_address, assignment.end_address, worker_id));
        }

        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[1].0 <= pair[0].1 {
                return Err(ErrorKind::RegistryInvalid(format!(
                    "assignments of {} and {} overlap",
                    pair[0].2, pair[1].2
                )))?;
            }
        }
        Ok(())
    }

    /// Drop every assignment without a sign of life within `stale_after`.
    /// The cursor stays put; freed ranges become holes.
    pub fn reclaim_stale(&mut self, now: DateTime<Utc>, stale_after: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .assignments
            .values()
            .filter(|assignment| now - assignment.freshness() > stale_after)
            .map(|assignment| assignment.worker_id.clone())
            .collect();
        for worker_id in &stale {
            self.assignments.remove(worker_id);
        }
        stale
    }

    /// Bind the next free contiguous range to `worker_id`. Re-reservation by
    /// an already assigned worker returns its existing slice unchanged.
    pub fn reserve(
        &mut self,
        worker_id: &str,
        public_endpoint: Option<String>,
        now: DateTime<Utc>,
    ) -> error::Result<Vec<String>> {
        if let Some(existing) = self.assignments.get(worker_id) {
            return Ok(existing.addresses.clone());
        }

        let count = self.addresses_per_instance;
        if self.next_available + count > self.addresses.len() {
            let left = self.addresses.len() - self.next_available;
            return Err(ErrorKind::RegistryExhausted(left, count))?;
        }

        let start_address = self.next_available;
        let end_address = start_address + count - 1;
        let addresses = self.addresses[start_address..=end_address].to_vec();
        self.assignments.insert(
            worker_id.to_string(),
            Assignment {
                worker_id: worker_id.to_string(),
                public_endpoint,
                start_address,
                end_address,
                addresses: addresses.clone(),
                assigned_at: now,
                last_heartbeat: Some(now),
            },
        );
        self.next_available = end_address + 1;
        Ok(addresses)
    }
}

/// Result of one application of a registry mutation closure
pub enum Mutation<T> {
    /// Write the modified document back
    Changed(T),
    /// Nothing to persist; short-circuit the loop
    Unchanged(T),
}

/// Registry access with the conditional-write discipline applied
#[derive(Clone)]
pub struct RegistryStore {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl RegistryStore {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[inline]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Fetch the current document together with its revision tag
    pub async fn load(&self) -> error::Result<Option<(Registry, String)>> {
        match self.store.get(REGISTRY_KEY).await? {
            None => Ok(None),
            Some(object) => {
                let registry: Registry = serde_json::from_slice(&object.body)?;
                Ok(Some((registry, object.etag)))
            }
        }
    }

    /// Create the registry or refresh its address list and slice size.
    /// Existing assignments survive a re-seed; a refreshed list that no longer
    /// covers them is a fatal configuration error.
    pub async fn seed(
        &self,
        addresses: Vec<String>,
        addresses_per_instance: usize,
    ) -> error::Result<Registry> {
        let mut backoff = Backoff::registry();
        for _ in 0..ALLOCATOR_CAS_ATTEMPTS {
            let (registry, precondition) = match self.load().await? {
                None => (
                    Registry::new(addresses.clone(), addresses_per_instance),
                    Precondition::IfAbsent,
                ),
                Some((mut registry, etag)) => {
                    registry.addresses = addresses.clone();
                    registry.addresses_per_instance = addresses_per_instance;
                    (registry, Precondition::IfMatch(etag))
                }
            };
            registry.validate()?;

            let body = serde_json::to_vec_pretty(&registry)?;
            match self
                .store
                .put_conditional(REGISTRY_KEY, body, precondition)
                .await?
            {
                CasOutcome::Committed => return Ok(registry),
                CasOutcome::PreconditionFailed => {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
        Err(ErrorKind::RegistryContention("seeding kept losing the conditional write".to_string()))?
    }

    /// Run `apply` against the current document and commit the result with a
    /// conditional write. Lost races re-read and re-apply; the closure errors
    /// abort immediately.
    pub async fn update<T, F>(&self, attempts: u32, mut apply: F) -> error::Result<T>
    where
        F: FnMut(&mut Registry) -> error::Result<Mutation<T>>,
    {
        let mut backoff = Backoff::registry();
        for attempt in 0..attempts {
            let (mut registry, etag) = self
                .load()
                .await?
                .ok_or_else(|| error::Error::from(ErrorKind::RegistryMissing))?;

            match apply(&mut registry)? {
                Mutation::Unchanged(value) => return Ok(value),
                Mutation::Changed(value) => {
                    let body = serde_json::to_vec_pretty(&registry)?;
                    match self
                        .store
                        .put_conditional(REGISTRY_KEY, body, Precondition::IfMatch(etag))
                        .await?
                    {
                        CasOutcome::Committed => return Ok(value),
                        CasOutcome::PreconditionFailed => {
                            debug!(
                                "Registry: conditional write lost (attempt {}), re-reading",
                                attempt + 1
                            );
                            tokio::time::sleep(backoff.next_delay()).await;
                        }
                    }
                }
            }
        }
        Err(ErrorKind::RegistryContention(format!(
            "conditional write failed {} times",
            attempts
        )))?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{addresses, MemStore, ManualClock};

    fn registry(count: usize, per_instance: usize) -> Registry {
        Registry::new(addresses(count), per_instance)
    }

    #[test]
    fn test_reserve_hands_out_disjoint_contiguous_ranges() {
        let now = Utc::now();
        let mut registry = registry(20, 5);

        let first = registry.reserve("w1", None, now).unwrap();
        let second = registry.reserve("w2", None, now).unwrap();

        assert_eq!(first, addresses(20)[0..5].to_vec());
        assert_eq!(second, addresses(20)[5..10].to_vec());
        assert_eq!(registry.next_available, 10);
        registry.validate().unwrap();
    }

    #[test]
    fn test_reserve_is_idempotent_per_worker() {
        let now = Utc::now();
        let mut registry = registry(20, 5);

        let first = registry.reserve("w1", None, now).unwrap();
        let again = registry.reserve("w1", None, now).unwrap();

        assert_eq!(first, again);
        assert_eq!(registry.assignments.len(), 1);
        assert_eq!(registry.next_available, 5);
    }

    #[test]
    fn test_reserve_reports_exhaustion() {
        let now = Utc::now();
        let mut registry = registry(8, 5);

        registry.reserve("w1", None, now).unwrap();
        let err = registry.reserve("w2", None, now).unwrap_err();
        match err.kind() {
            ErrorKind::RegistryExhausted(left, requested) => {
                assert_eq!(left, 3);
                assert_eq!(requested, 5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_reclaim_keeps_cursor_and_skips_fresh() {
        let now = Utc::now();
        let mut registry = registry(20, 5);
        registry.reserve("w1", None, now).unwrap();
        registry.reserve("w2", None, now).unwrap();

        // age only w1
        registry
            .assignments
            .get_mut("w1")
            .map(|a| {
                a.assigned_at = now - Duration::minutes(45);
                a.last_heartbeat = Some(now - Duration::minutes(31));
            })
            .unwrap();

        let reclaimed = registry.reclaim_stale(now, Duration::minutes(30));
        assert_eq!(reclaimed, vec!["w1".to_string()]);
        assert!(registry.assignments.contains_key("w2"));
        // freed range becomes a hole; the cursor stays
        assert_eq!(registry.next_available, 10);
        registry.validate().unwrap();
    }

    #[test]
    fn test_freshness_prefers_heartbeat_over_assignment_time() {
        let now = Utc::now();
        let mut registry = registry(20, 5);
        registry.reserve("w1", None, now - Duration::minutes(50)).unwrap();
        registry
            .assignments
            .get_mut("w1")
            .map(|a| a.last_heartbeat = Some(now - Duration::minutes(1)))
            .unwrap();

        assert!(registry.reclaim_stale(now, Duration::minutes(30)).is_empty());
    }

    #[test]
    fn test_validate_rejects_overlap_and_runaway_cursor() {
        let now = Utc::now();
        let mut registry = registry(20, 5);
        registry.reserve("w1", None, now).unwrap();
        registry.reserve("w2", None, now).unwrap();

        registry
            .assignments
            .get_mut("w2")
            .map(|a| a.start_address = 3)
            .unwrap();
        assert!(registry.validate().is_err());

        let mut registry = registry_with_short_list();
        assert!(registry.validate().is_err());
        registry.assignments.clear();
        registry.next_available = 0;
        registry.validate().unwrap();
    }

    fn registry_with_short_list() -> Registry {
        // an assignment surviving a re-seed that shrank the address list
        let now = Utc::now();
        let mut registry = registry(20, 5);
        registry.reserve("w1", None, now).unwrap();
        registry.addresses.truncate(3);
        registry.next_available = 3;
        registry
    }

    #[tokio::test]
    async fn test_seed_preserves_assignments() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry_store = RegistryStore::new(store.clone(), clock.clone());

        registry_store.seed(addresses(10), 5).await.unwrap();
        let reserved = registry_store
            .update(ALLOCATOR_CAS_ATTEMPTS, |registry| {
                registry
                    .reserve("w1", None, clock.now())
                    .map(Mutation::Changed)
            })
            .await
            .unwrap();
        assert_eq!(reserved.len(), 5);

        // re-seed with a longer list; the live assignment must survive
        let seeded = registry_store.seed(addresses(30), 5).await.unwrap();
        assert!(seeded.assignments.contains_key("w1"));
        assert_eq!(seeded.addresses.len(), 30);
        assert_eq!(seeded.next_available, 5);
    }

    #[tokio::test]
    async fn test_seed_rejects_list_that_breaks_assignments() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry_store = RegistryStore::new(store.clone(), clock.clone());

        registry_store.seed(addresses(10), 5).await.unwrap();
        registry_store
            .update(ALLOCATOR_CAS_ATTEMPTS, |registry| {
                registry
                    .reserve("w1", None, clock.now())
                    .map(Mutation::Changed)
            })
            .await
            .unwrap();

        let err = registry_store.seed(addresses(3), 5).await.unwrap_err();
        match err.kind() {
            ErrorKind::RegistryInvalid(_) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_reserves_stay_disjoint() {
        // scenario S1: two workers race for their first slice
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry_store = RegistryStore::new(store.clone(), clock.clone());
        registry_store.seed(addresses(20), 5).await.unwrap();

        let mut handles = Vec::new();
        for worker_id in &["w1", "w2"] {
            let registry_store = registry_store.clone();
            let clock = clock.clone();
            let worker_id = worker_id.to_string();
            handles.push(tokio::spawn(async move {
                registry_store
                    .update(ALLOCATOR_CAS_ATTEMPTS, move |registry| {
                        registry
                            .reserve(&worker_id, None, clock.now())
                            .map(Mutation::Changed)
                    })
                    .await
                    .unwrap()
            }));
        }

        let first = handles.remove(0).await.unwrap();
        let second = handles.remove(0).await.unwrap();

        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 5);
        assert!(first.iter().all(|a| !second.contains(a)));

        let (registry, _) = registry_store.load().await.unwrap().unwrap();
        assert_eq!(registry.next_available, 10);
        registry.validate().unwrap();
    }

    #[tokio::test]
    async fn test_update_unchanged_skips_write() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry_store = RegistryStore::new(store.clone(), clock.clone());
        registry_store.seed(addresses(10), 5).await.unwrap();

        let writes_before = store.writes();
        let value = registry_store
            .update(ALLOCATOR_CAS_ATTEMPTS, |_| Ok(Mutation::Unchanged(42)))
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(store.writes(), writes_before);
    }
}
