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

//! Fleet-wide submission statistics. Best-effort telemetry updated under an
//! optimistic lock by every worker; exhausted retries are swallowed because
//! the Mine API, not this object, is the source of truth.

use hiveminer_logging::macros::*;

use crate::backoff;
use crate::error;
use crate::hal::{CasOutcome, Clock, ObjectStore, Precondition};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use std::time::Duration;

/// Stats object key within the regional bucket
pub const STATS_KEY: &str = "solutions-stats.json";

/// Strict cap on both recent lists; the oldest entry is dropped on overflow
pub const RECENT_CAP: usize = 20;

/// Optimistic-lock attempts per update
const CAS_ATTEMPTS: u32 = 5;

/// Random jitter bound between attempts
const CAS_JITTER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentSolution {
    pub address: String,
    pub challenge_id: String,
    pub nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<String>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// The `solutions-stats.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_solutions: u64,
    pub donation_solutions: u64,
    pub total_errors: u64,
    pub last_updated: DateTime<Utc>,
    pub recent_solutions: Vec<RecentSolution>,
    pub recent_errors: Vec<RecentError>,
}

impl Stats {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            total_solutions: 0,
            donation_solutions: 0,
            total_errors: 0,
            last_updated: now,
            recent_solutions: Vec::new(),
            recent_errors: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct StatsLedger {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl StatsLedger {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn load(&self) -> error::Result<Stats> {
        match self.store.get(STATS_KEY).await? {
            Some(object) => Ok(serde_json::from_slice(&object.body)?),
            None => Ok(Stats::empty(self.clock.now())),
        }
    }

    /// Count one accepted submission. Never fails the caller; the submission
    /// itself already succeeded.
    pub async fn record_solution(&self, entry: RecentSolution, donation: bool) {
        let outcome = self
            .try_update(|stats| {
                stats.total_solutions += 1;
                if donation {
                    stats.donation_solutions += 1;
                }
                stats.recent_solutions.insert(0, entry.clone());
                stats.recent_solutions.truncate(RECENT_CAP);
            })
            .await;
        if let Err(e) = outcome {
            warn!("Stats: solution not counted: {}", e);
        }
    }

    /// Count one failed submission
    pub async fn record_error(&self, entry: RecentError) {
        let outcome = self
            .try_update(|stats| {
                stats.total_errors += 1;
                stats.recent_errors.insert(0, entry.clone());
                stats.recent_errors.truncate(RECENT_CAP);
            })
            .await;
        if let Err(e) = outcome {
            warn!("Stats: error not counted: {}", e);
        }
    }

    async fn try_update<F>(&self, mut apply: F) -> error::Result<()>
    where
        F: FnMut(&mut Stats),
    {
        for attempt in 0..CAS_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff::jitter(CAS_JITTER)).await;
            }

            let (mut stats, precondition) = match self.store.get(STATS_KEY).await? {
                Some(object) => (
                    serde_json::from_slice::<Stats>(&object.body)?,
                    Precondition::IfMatch(object.etag),
                ),
                None => (Stats::empty(self.clock.now()), Precondition::IfAbsent),
            };

            apply(&mut stats);
            stats.last_updated = self.clock.now();

            let body = serde_json::to_vec_pretty(&stats)?;
            match self
                .store
                .put_conditional(STATS_KEY, body, precondition)
                .await?
            {
                CasOutcome::Committed => return Ok(()),
                CasOutcome::PreconditionFailed => continue,
            }
        }
        Err(error::ErrorKind::Store(format!(
            "stats update lost {} races",
            CAS_ATTEMPTS
        )))?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{MemStore, ManualClock};

    fn solution(address: &str, challenge_id: &str, now: DateTime<Utc>) -> RecentSolution {
        RecentSolution {
            address: address.to_string(),
            challenge_id: challenge_id.to_string(),
            nonce: "1".to_string(),
            worker_id: None,
            submitted_at: now,
        }
    }

    fn ledger() -> (StatsLedger, Arc<ManualClock>) {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (StatsLedger::new(store, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_counters_and_recent_lists() {
        let (ledger, clock) = ledger();
        let now = clock.now();

        ledger.record_solution(solution("a", "c1", now), false).await;
        ledger.record_solution(solution("d", "c1", now), true).await;
        ledger
            .record_error(RecentError {
                address: Some("a".to_string()),
                challenge_id: Some("c2".to_string()),
                message: "boom".to_string(),
                occurred_at: now,
            })
            .await;

        let stats = ledger.load().await.unwrap();
        assert_eq!(stats.total_solutions, 2);
        assert_eq!(stats.donation_solutions, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.recent_solutions.len(), 2);
        assert_eq!(stats.recent_errors.len(), 1);
        // newest first
        assert_eq!(stats.recent_solutions[0].address, "d");
    }

    #[tokio::test]
    async fn test_recent_list_cap_is_strict() {
        let (ledger, clock) = ledger();
        let now = clock.now();

        for i in 0..(RECENT_CAP + 5) {
            ledger
                .record_solution(solution(&format!("a{}", i), "c1", now), false)
                .await;
        }

        let stats = ledger.load().await.unwrap();
        assert_eq!(stats.total_solutions, (RECENT_CAP + 5) as u64);
        assert_eq!(stats.recent_solutions.len(), RECENT_CAP);
        // the oldest entries were dropped
        assert_eq!(stats.recent_solutions[0].address, "a24");
        assert_eq!(
            stats.recent_solutions[RECENT_CAP - 1].address,
            "a5"
        );
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        // scenario S6: two workers record different solutions concurrently
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let now = clock.now();

        let mut handles = Vec::new();
        for (address, challenge_id) in &[("a", "c1"), ("b", "c2")] {
            let ledger = StatsLedger::new(store.clone(), clock.clone());
            let entry = solution(address, challenge_id, now);
            handles.push(tokio::spawn(async move {
                ledger.record_solution(entry, false).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = StatsLedger::new(store, clock).load().await.unwrap();
        assert_eq!(stats.total_solutions, 2);
        let mut addresses: Vec<String> = stats
            .recent_solutions
            .iter()
            .map(|entry| entry.address.clone())
            .collect();
        addresses.sort();
        assert_eq!(addresses, vec!["a".to_string(), "b".to_string()]);
    }
}
