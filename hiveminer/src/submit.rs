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

//! Solution submission and bookkeeping. Per-address records give at-most-once
//! semantics per (address, challenge) pair; the stats object is advisory and
//! must never fail a submission.

use hiveminer_logging::macros::*;

use crate::api;
use crate::hal::{Clock, MineApi};
use crate::solutions::SolutionsLedger;
use crate::stats::{RecentError, RecentSolution, StatsLedger};
use crate::work::WorkItem;

use std::sync::Arc;

/// What became of one mined nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Accepted (or already known) and recorded locally
    Recorded,
    /// The submission window closed before the POST; nothing was sent
    Expired,
    /// Submission failed; the item may be retried on a later pass
    Failed,
}

pub struct Submitter {
    api: Arc<dyn MineApi>,
    solutions: SolutionsLedger,
    stats: StatsLedger,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl Submitter {
    pub fn new(
        api: Arc<dyn MineApi>,
        solutions: SolutionsLedger,
        stats: StatsLedger,
        clock: Arc<dyn Clock>,
        worker_id: String,
    ) -> Self {
        Self {
            api,
            solutions,
            stats,
            clock,
            worker_id,
        }
    }

    pub async fn submit(&self, item: &WorkItem, nonce: &str) -> Disposition {
        let challenge_id = &item.challenge.challenge_id;

        // the expiry scan runs every few seconds; this guard closes the gap
        if item.challenge.latest_submission <= self.clock.now() {
            warn!(
                "Submit: dropping {} for {}, window closed",
                challenge_id, item.address
            );
            return Disposition::Expired;
        }

        match self
            .api
            .submit_solution(&item.address, challenge_id, nonce)
            .await
        {
            api::Submit::Accepted(_) => {
                info!("Submit: {} accepted for {}", challenge_id, item.address);
                self.record(item, nonce).await;
                Disposition::Recorded
            }
            api::Submit::Duplicate => {
                // someone (possibly an earlier incarnation of this worker)
                // got there first; record locally to suppress retries
                info!(
                    "Submit: {} for {} already known upstream",
                    challenge_id, item.address
                );
                self.record(item, nonce).await;
                Disposition::Recorded
            }
            api::Submit::Transient(message) => {
                warn!(
                    "Submit: transient failure for {}/{}: {}",
                    item.address, challenge_id, message
                );
                self.record_failure(item, message).await;
                Disposition::Failed
            }
            api::Submit::Fatal(message) => {
                error!(
                    "Submit: rejected for {}/{}: {}",
                    item.address, challenge_id, message
                );
                self.record_failure(item, message).await;
                Disposition::Failed
            }
        }
    }

    async fn record(&self, item: &WorkItem, nonce: &str) {
        let now = self.clock.now();

        if !item.donation {
            // a lost write only means a future 409 from the Mine API; the
            // dedup there remains the source of truth
            if let Err(e) = self
                .solutions
                .record(
                    &item.address,
                    &item.challenge.challenge_id,
                    nonce,
                    Some(&self.worker_id),
                )
                .await
            {
                warn!(
                    "Submit: solution record for {} not written: {}",
                    item.address, e
                );
            }
        }

        self.stats
            .record_solution(
                RecentSolution {
                    address: item.address.clone(),
                    challenge_id: item.challenge.challenge_id.clone(),
                    nonce: nonce.to_string(),
                    worker_id: Some(self.worker_id.clone()),
                    submitted_at: now,
                },
                item.donation,
            )
            .await;
    }

    async fn record_failure(&self, item: &WorkItem, message: String) {
        self.stats
            .record_error(RecentError {
                address: Some(item.address.clone()),
                challenge_id: Some(item.challenge.challenge_id.clone()),
                message,
                occurred_at: self.clock.now(),
            })
            .await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{challenge_closing_in, FakeApi, MemStore, ManualClock};

    use chrono::{Duration, Utc};

    struct Fixture {
        submitter: Submitter,
        api: Arc<FakeApi>,
        solutions: SolutionsLedger,
        stats: StatsLedger,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let api = Arc::new(FakeApi::new());
        let solutions = SolutionsLedger::new(store.clone(), clock.clone());
        let stats = StatsLedger::new(store.clone(), clock.clone());
        Fixture {
            submitter: Submitter::new(
                api.clone(),
                solutions.clone(),
                stats.clone(),
                clock.clone(),
                "w1".to_string(),
            ),
            api,
            solutions,
            stats,
            clock,
        }
    }

    fn open_item(clock: &ManualClock) -> WorkItem {
        WorkItem::new(
            "a".to_string(),
            challenge_closing_in("c1", "ff", clock, Duration::hours(1)),
        )
    }

    #[tokio::test]
    async fn test_accepted_submission_is_recorded_everywhere() {
        let f = fixture();
        let item = open_item(&f.clock);

        let disposition = f.submitter.submit(&item, "42").await;
        assert_eq!(disposition, Disposition::Recorded);

        assert!(f.solutions.has_solution("a", "c1").await.unwrap());
        let stats = f.stats.load().await.unwrap();
        assert_eq!(stats.total_solutions, 1);
        assert_eq!(stats.donation_solutions, 0);
        assert_eq!(stats.recent_solutions[0].worker_id.as_deref(), Some("w1"));
        assert_eq!(f.api.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_counts_as_success() {
        let f = fixture();
        let item = open_item(&f.clock);
        f.api.set_submit_outcome(api::Submit::Duplicate);

        let disposition = f.submitter.submit(&item, "42").await;
        assert_eq!(disposition, Disposition::Recorded);
        // recorded locally so the pair is never retried
        assert!(f.solutions.has_solution("a", "c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_item_is_never_posted() {
        let f = fixture();
        let item = open_item(&f.clock);
        f.clock.advance(Duration::hours(2));

        let disposition = f.submitter.submit(&item, "42").await;
        assert_eq!(disposition, Disposition::Expired);
        assert!(f.api.submissions().is_empty());
        assert!(!f.solutions.has_solution("a", "c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_failure_records_error_only() {
        let f = fixture();
        let item = open_item(&f.clock);
        f.api
            .set_submit_outcome(api::Submit::Transient("503".to_string()));

        let disposition = f.submitter.submit(&item, "42").await;
        assert_eq!(disposition, Disposition::Failed);
        assert!(!f.solutions.has_solution("a", "c1").await.unwrap());

        let stats = f.stats.load().await.unwrap();
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.recent_errors[0].message, "503");
    }

    #[tokio::test]
    async fn test_donation_skips_per_address_file() {
        let f = fixture();
        let clock = &f.clock;
        let item = WorkItem::donation(
            "donate".to_string(),
            challenge_closing_in("c1", "ff", clock.as_ref(), Duration::hours(1)),
        );

        let disposition = f.submitter.submit(&item, "42").await;
        assert_eq!(disposition, Disposition::Recorded);

        assert!(!f.solutions.has_solution("donate", "c1").await.unwrap());
        let stats = f.stats.load().await.unwrap();
        assert_eq!(stats.total_solutions, 1);
        assert_eq!(stats.donation_solutions, 1);
    }
}
