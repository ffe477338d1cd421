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

//! Leader-elected reclamation of dead workers' assignments. Election is
//! deterministic and lock-free: the lexicographically first live worker wins.
//! A rare double run is harmless because the registry conditional write lets
//! only one winner commit.

use hiveminer_logging::macros::*;

use crate::error;
use crate::hal::{Clock, ComputeProvider};
use crate::halt;
use crate::heartbeat::Heartbeats;
use crate::registry::{Mutation, RegistryStore, RECLAIMER_CAS_ATTEMPTS};

use chrono::Duration as ChronoDuration;

use std::sync::Arc;
use std::time::Duration;

pub struct Reclaimer {
    registry: RegistryStore,
    heartbeats: Heartbeats,
    compute: Arc<dyn ComputeProvider>,
    clock: Arc<dyn Clock>,
    worker_id: String,
    /// Loose staleness bound; steady-state churn should stay low
    stale_after: ChronoDuration,
    interval: Duration,
}

impl Reclaimer {
    pub fn new(
        registry: RegistryStore,
        heartbeats: Heartbeats,
        compute: Arc<dyn ComputeProvider>,
        clock: Arc<dyn Clock>,
        worker_id: String,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            heartbeats,
            compute,
            clock,
            worker_id,
            stale_after: ChronoDuration::from_std(stale_after)
                .expect("BUG: stale threshold out of range"),
            interval,
        }
    }

    /// True when this worker sorts first among all live workers in the region
    pub async fn is_leader(&self) -> error::Result<bool> {
        let mut ids: Vec<String> = self
            .compute
            .list_workers()
            .await?
            .into_iter()
            .map(|instance| instance.id)
            .collect();
        if ids.is_empty() {
            // the control plane may lag behind a fresh boot; do not assume
            // leadership with no evidence of any live worker
            return Ok(false);
        }
        ids.sort();
        Ok(ids[0] == self.worker_id)
    }

    /// Drop every assignment whose worker has no recent heartbeat. Workers
    /// that never managed a single beat are judged by their assignment age.
    pub async fn reclaim_once(&self) -> error::Result<Vec<String>> {
        let beats = self.heartbeats.collect().await?;
        let now = self.clock.now();
        let stale_after = self.stale_after;

        let reclaimed = self
            .registry
            .update(RECLAIMER_CAS_ATTEMPTS, move |registry| {
                let victims: Vec<String> = registry
                    .assignments
                    .values()
                    .filter(|assignment| match beats.get(&assignment.worker_id) {
                        Some(heartbeat) => now - heartbeat.last_heartbeat > stale_after,
                        None => now - assignment.assigned_at > stale_after,
                    })
                    .map(|assignment| assignment.worker_id.clone())
                    .collect();
                for worker_id in &victims {
                    registry.assignments.remove(worker_id);
                }
                if victims.is_empty() {
                    Ok(Mutation::Unchanged(victims))
                } else {
                    Ok(Mutation::Changed(victims))
                }
            })
            .await?;

        for worker_id in &reclaimed {
            if let Err(e) = self.heartbeats.remove(worker_id).await {
                warn!("Reclaimer: heartbeat of {} not removed: {}", worker_id, e);
            }
        }
        Ok(reclaimed)
    }

    /// Periodic reclamation tick; all failures are logged and retried on the
    /// next interval
    pub async fn run(self, mut halt_receiver: halt::Receiver) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = halt_receiver.wait_for_halt() => {
                    info!("Reclaimer: task stopped");
                    return;
                }
            }
            match self.is_leader().await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    warn!("Reclaimer: leader election failed: {}", e);
                    continue;
                }
            }
            match self.reclaim_once().await {
                Ok(reclaimed) if reclaimed.is_empty() => {
                    debug!("Reclaimer: nothing to reclaim");
                }
                Ok(reclaimed) => {
                    info!("Reclaimer: dropped assignments of {:?}", reclaimed);
                }
                Err(e) => warn!("Reclaimer: pass failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::{Mutation, ALLOCATOR_CAS_ATTEMPTS};
    use crate::test_utils::{addresses, FakeCompute, MemStore, ManualClock};

    use chrono::Utc;

    const STALE: Duration = Duration::from_secs(30 * 60);

    fn reclaimer_for(
        store: Arc<MemStore>,
        clock: Arc<ManualClock>,
        compute: Arc<FakeCompute>,
        worker_id: &str,
    ) -> Reclaimer {
        Reclaimer::new(
            RegistryStore::new(store.clone(), clock.clone()),
            Heartbeats::new(store, clock.clone()),
            compute,
            clock,
            worker_id.to_string(),
            STALE,
            Duration::from_secs(20 * 60),
        )
    }

    #[tokio::test]
    async fn test_exactly_one_leader_in_stable_fleet() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let compute = Arc::new(FakeCompute::with_workers(&["w2", "w1", "w3"]));

        let mut leaders = 0;
        for worker_id in &["w1", "w2", "w3"] {
            let reclaimer =
                reclaimer_for(store.clone(), clock.clone(), compute.clone(), worker_id);
            if reclaimer.is_leader().await.unwrap() {
                leaders += 1;
                assert_eq!(*worker_id, "w1");
            }
        }
        assert_eq!(leaders, 1);
    }

    #[tokio::test]
    async fn test_no_leader_without_live_workers() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let compute = Arc::new(FakeCompute::with_workers(&[]));

        let reclaimer = reclaimer_for(store, clock, compute, "w1");
        assert!(!reclaimer.is_leader().await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaim_drops_dead_worker_but_keeps_cursor() {
        // scenario S2: crash of w1, reclamation 31 minutes later
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry_store = RegistryStore::new(store.clone(), clock.clone());
        let heartbeats = Heartbeats::new(store.clone(), clock.clone());
        registry_store.seed(addresses(20), 5).await.unwrap();

        registry_store
            .update(ALLOCATOR_CAS_ATTEMPTS, |registry| {
                registry
                    .reserve("w1", None, clock.now())
                    .map(Mutation::Changed)
            })
            .await
            .unwrap();
        heartbeats.beat("w1", None).await.unwrap();

        clock.advance(chrono::Duration::minutes(31));
        let compute = Arc::new(FakeCompute::with_workers(&["w2"]));
        let reclaimer = reclaimer_for(store.clone(), clock.clone(), compute, "w2");
        assert!(reclaimer.is_leader().await.unwrap());

        let reclaimed = reclaimer.reclaim_once().await.unwrap();
        assert_eq!(reclaimed, vec!["w1".to_string()]);

        let (registry, _) = registry_store.load().await.unwrap().unwrap();
        assert!(registry.assignments.is_empty());
        // the freed range is not reused by the simple policy
        assert_eq!(registry.next_available, 5);

        // the dead worker's heartbeat file is gone as well
        assert!(heartbeats.collect().await.unwrap().is_empty());

        // a later worker takes the next range, not the hole
        let reserved = registry_store
            .update(ALLOCATOR_CAS_ATTEMPTS, |registry| {
                registry
                    .reserve("w3", None, clock.now())
                    .map(Mutation::Changed)
            })
            .await
            .unwrap();
        assert_eq!(reserved, addresses(20)[5..10].to_vec());
    }

    #[tokio::test]
    async fn test_missing_heartbeat_judged_by_assignment_age() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry_store = RegistryStore::new(store.clone(), clock.clone());
        registry_store.seed(addresses(20), 5).await.unwrap();

        registry_store
            .update(ALLOCATOR_CAS_ATTEMPTS, |registry| {
                registry
                    .reserve("w1", None, clock.now())
                    .map(Mutation::Changed)
            })
            .await
            .unwrap();

        let compute = Arc::new(FakeCompute::with_workers(&["w2"]));
        let reclaimer = reclaimer_for(store.clone(), clock.clone(), compute, "w2");

        // young assignment without heartbeat survives
        assert!(reclaimer.reclaim_once().await.unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(31));
        assert_eq!(
            reclaimer.reclaim_once().await.unwrap(),
            vec!["w1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_protects_assignment() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry_store = RegistryStore::new(store.clone(), clock.clone());
        let heartbeats = Heartbeats::new(store.clone(), clock.clone());
        registry_store.seed(addresses(20), 5).await.unwrap();

        registry_store
            .update(ALLOCATOR_CAS_ATTEMPTS, |registry| {
                registry
                    .reserve("w1", None, clock.now())
                    .map(Mutation::Changed)
            })
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(31));
        // the worker kept beating even though the assignment itself is old
        heartbeats.beat("w1", None).await.unwrap();

        let compute = Arc::new(FakeCompute::with_workers(&["w2"]));
        let reclaimer = reclaimer_for(store.clone(), clock.clone(), compute, "w2");
        assert!(reclaimer.reclaim_once().await.unwrap().is_empty());
    }
}
