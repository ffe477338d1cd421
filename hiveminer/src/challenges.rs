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

//! Shared queue of known active challenges and the periodic Mine API poll
//! feeding it

use hiveminer_logging::macros::*;

use crate::api;
use crate::backoff::Backoff;
use crate::error;
use crate::hal::{CasOutcome, Clock, MineApi, ObjectStore, Precondition};
use crate::halt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use std::time::Duration;

/// Challenge cache object key within the regional bucket
pub const CHALLENGES_KEY: &str = "challenges.json";

/// Conditional-write attempts; contention here is light because upserts are
/// idempotent across the fleet
const CAS_ATTEMPTS: u32 = 10;

const CAS_BACKOFF_BASE: Duration = Duration::from_millis(100);
const CAS_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// One cached challenge as stored in `challenges.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedChallenge {
    pub challenge_id: String,
    pub challenge_number: u64,
    pub day: u32,
    /// Hex mask; more set bits means denser valid hashes, i.e. easier work
    pub difficulty: String,
    pub no_pre_mine: String,
    pub no_pre_mine_hour: String,
    pub latest_submission: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_at: Option<DateTime<Utc>>,
}

impl From<api::Challenge> for QueuedChallenge {
    fn from(challenge: api::Challenge) -> Self {
        Self {
            challenge_id: challenge.challenge_id,
            challenge_number: challenge.challenge_number,
            day: challenge.day,
            difficulty: challenge.difficulty,
            no_pre_mine: challenge.no_pre_mine,
            no_pre_mine_hour: challenge.no_pre_mine_hour,
            latest_submission: challenge.latest_submission,
            available_at: challenge.issued_at,
        }
    }
}

impl QueuedChallenge {
    /// A challenge is minable until its submission window closes
    #[inline]
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.latest_submission > now
    }
}

/// The `challenges.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeCache {
    pub challenges: Vec<QueuedChallenge>,
    pub last_updated: DateTime<Utc>,
    pub region: String,
}

/// Shared challenge cache with conditional-write updates
#[derive(Clone)]
pub struct ChallengeLedger {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    region: String,
}

impl ChallengeLedger {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, region: String) -> Self {
        Self {
            store,
            clock,
            region,
        }
    }

    async fn load_with_etag(&self) -> error::Result<(ChallengeCache, Option<String>)> {
        match self.store.get(CHALLENGES_KEY).await? {
            Some(object) => {
                let cache = serde_json::from_slice(&object.body)?;
                Ok((cache, Some(object.etag)))
            }
            None => Ok((
                ChallengeCache {
                    challenges: Vec::new(),
                    last_updated: self.clock.now(),
                    region: self.region.clone(),
                },
                None,
            )),
        }
    }

    pub async fn load(&self) -> error::Result<ChallengeCache> {
        Ok(self.load_with_etag().await?.0)
    }

    /// Challenges still worth mining right now
    pub async fn open_challenges(&self) -> error::Result<Vec<QueuedChallenge>> {
        let now = self.clock.now();
        let cache = self.load().await?;
        Ok(cache
            .challenges
            .into_iter()
            .filter(|challenge| challenge.is_open(now))
            .collect())
    }

    /// Insert or refresh one challenge, pruning closed ones on the way
    pub async fn upsert(&self, challenge: QueuedChallenge) -> error::Result<()> {
        let mut backoff = Backoff::new(CAS_BACKOFF_BASE, CAS_BACKOFF_CAP);
        for _ in 0..CAS_ATTEMPTS {
            let (mut cache, etag) = self.load_with_etag().await?;
            let now = self.clock.now();

            cache.challenges.retain(|known| known.is_open(now));
            match cache
                .challenges
                .iter_mut()
                .find(|known| known.challenge_id == challenge.challenge_id)
            {
                Some(known) => *known = challenge.clone(),
                None => cache.challenges.push(challenge.clone()),
            }
            cache.last_updated = now;
            cache.region = self.region.clone();

            let precondition = match etag {
                Some(etag) => Precondition::IfMatch(etag),
                None => Precondition::IfAbsent,
            };
            let body = serde_json::to_vec_pretty(&cache)?;
            match self
                .store
                .put_conditional(CHALLENGES_KEY, body, precondition)
                .await?
            {
                CasOutcome::Committed => return Ok(()),
                CasOutcome::PreconditionFailed => {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
        Err(error::ErrorKind::Store(
            "challenge cache kept losing the conditional write".to_string(),
        ))?
    }
}

/// Periodic Mine API poll feeding the shared cache
pub struct Puller {
    api: Arc<dyn MineApi>,
    ledger: ChallengeLedger,
}

impl Puller {
    pub fn new(api: Arc<dyn MineApi>, ledger: ChallengeLedger) -> Self {
        Self { api, ledger }
    }

    /// One poll. API trouble never clears the cache; stale knowledge beats
    /// none while the service recovers.
    pub async fn fetch_once(&self) -> error::Result<Option<QueuedChallenge>> {
        match self.api.fetch_challenge().await? {
            api::ChallengeStatus::Active { challenge, .. } => {
                let queued = QueuedChallenge::from(challenge);
                self.ledger.upsert(queued.clone()).await?;
                info!(
                    "Challenges: active challenge {} (closes {})",
                    queued.challenge_id, queued.latest_submission
                );
                Ok(Some(queued))
            }
            api::ChallengeStatus::Before {
                next_challenge_starts_at,
            } => {
                info!(
                    "Challenges: mining period not started (next challenge {:?})",
                    next_challenge_starts_at
                );
                Ok(None)
            }
            api::ChallengeStatus::After { mining_period_ends } => {
                info!(
                    "Challenges: mining period over (ended {:?})",
                    mining_period_ends
                );
                Ok(None)
            }
        }
    }

    pub async fn run(self, interval: Duration, mut halt_receiver: halt::Receiver) {
        loop {
            if let Err(e) = self.fetch_once().await {
                warn!("Challenges: fetch failed, keeping cache: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = halt_receiver.wait_for_halt() => {
                    info!("Challenges: puller stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{challenge_closing_in, FakeApi, MemStore, ManualClock};

    fn ledger_with(store: Arc<MemStore>, clock: Arc<ManualClock>) -> ChallengeLedger {
        ChallengeLedger::new(store, clock, "eu-test-1".to_string())
    }

    #[tokio::test]
    async fn test_upsert_deduplicates_by_challenge_id() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = ledger_with(store, clock.clone());

        let mut challenge = challenge_closing_in("c1", "0f", &*clock, chrono::Duration::hours(1));
        ledger.upsert(challenge.clone()).await.unwrap();

        challenge.difficulty = "ff".to_string();
        ledger.upsert(challenge).await.unwrap();

        let cache = ledger.load().await.unwrap();
        assert_eq!(cache.challenges.len(), 1);
        assert_eq!(cache.challenges[0].difficulty, "ff");
        assert_eq!(cache.region, "eu-test-1");
    }

    #[tokio::test]
    async fn test_upsert_prunes_closed_challenges() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = ledger_with(store, clock.clone());

        ledger
            .upsert(challenge_closing_in(
                "short",
                "0f",
                &*clock,
                chrono::Duration::minutes(5),
            ))
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(10));
        ledger
            .upsert(challenge_closing_in(
                "fresh",
                "0f",
                &*clock,
                chrono::Duration::hours(1),
            ))
            .await
            .unwrap();

        let ids: Vec<String> = ledger
            .load()
            .await
            .unwrap()
            .challenges
            .into_iter()
            .map(|c| c.challenge_id)
            .collect();
        assert_eq!(ids, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_open_challenges_filters_by_clock() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = ledger_with(store, clock.clone());

        ledger
            .upsert(challenge_closing_in(
                "c1",
                "0f",
                &*clock,
                chrono::Duration::minutes(30),
            ))
            .await
            .unwrap();

        assert_eq!(ledger.open_challenges().await.unwrap().len(), 1);
        clock.advance(chrono::Duration::minutes(31));
        assert!(ledger.open_challenges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_puller_upserts_active_and_ignores_failures() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = ledger_with(store.clone(), clock.clone());
        let api = Arc::new(FakeApi::new());

        let queued = challenge_closing_in("c1", "0f", &*clock, chrono::Duration::hours(1));
        api.set_challenge(Some(queued.clone()));

        let puller = Puller::new(api.clone(), ledger.clone());
        puller.fetch_once().await.unwrap();
        assert_eq!(ledger.load().await.unwrap().challenges.len(), 1);

        // API failure must not clear the cache
        api.fail_challenge_fetch(true);
        assert!(puller.fetch_once().await.is_err());
        assert_eq!(ledger.load().await.unwrap().challenges.len(), 1);

        // "before" status is a no-op
        api.fail_challenge_fetch(false);
        api.set_challenge(None);
        puller.fetch_once().await.unwrap();
        assert_eq!(ledger.load().await.unwrap().challenges.len(), 1);
    }
}
