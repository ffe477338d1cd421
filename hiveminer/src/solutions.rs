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

//! Per-address submission records. One file per address, blind-written: each
//! address belongs to exactly one live worker so there is a single logical
//! writer in steady state.

use hiveminer_logging::macros::*;

use crate::error;
use crate::hal::{Clock, ObjectStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::collections::HashSet;
use std::sync::Arc;

pub const SOLUTIONS_PREFIX: &str = "solutions/";

pub fn solutions_key(address: &str) -> String {
    format!("{}{}.json", SOLUTIONS_PREFIX, address)
}

/// Combined key of one (address, challenge) pair; also used by the in-memory
/// dedup set and the in-progress set
pub fn pair_key(address: &str, challenge_id: &str) -> String {
    format!("{}-{}", address, challenge_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionRecord {
    pub challenge_id: String,
    pub nonce: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// The `solutions/{address}.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSolutions {
    pub address: String,
    pub solutions: Vec<SolutionRecord>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SolutionsLedger {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl SolutionsLedger {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn load(&self, address: &str) -> error::Result<Option<AddressSolutions>> {
        match self.store.get(&solutions_key(address)).await? {
            Some(object) => Ok(Some(serde_json::from_slice(&object.body)?)),
            None => Ok(None),
        }
    }

    pub async fn has_solution(&self, address: &str, challenge_id: &str) -> error::Result<bool> {
        Ok(self
            .load(address)
            .await?
            .map(|doc| {
                doc.solutions
                    .iter()
                    .any(|record| record.challenge_id == challenge_id)
            })
            .unwrap_or(false))
    }

    /// Record one submission. Repeated calls for the same (address, challenge)
    /// pair collapse into the first record.
    pub async fn record(
        &self,
        address: &str,
        challenge_id: &str,
        nonce: &str,
        worker_id: Option<&str>,
    ) -> error::Result<()> {
        let now = self.clock.now();
        let mut doc = self.load(address).await?.unwrap_or_else(|| AddressSolutions {
            address: address.to_string(),
            solutions: Vec::new(),
            last_updated: now,
        });

        if doc
            .solutions
            .iter()
            .any(|record| record.challenge_id == challenge_id)
        {
            debug!(
                "Solutions: {} already recorded for {}",
                challenge_id, address
            );
            return Ok(());
        }

        doc.solutions.push(SolutionRecord {
            challenge_id: challenge_id.to_string(),
            nonce: nonce.to_string(),
            submitted_at: now,
            worker_id: worker_id.map(|id| id.to_string()),
        });
        doc.last_updated = now;

        self.store
            .put(&solutions_key(address), serde_json::to_vec_pretty(&doc)?)
            .await
    }

    /// Solved (address, challenge) pairs for the given addresses; used to seed
    /// the in-memory dedup set at boot
    pub async fn load_index(&self, addresses: &[String]) -> error::Result<HashSet<String>> {
        let mut index = HashSet::new();
        for address in addresses {
            if let Some(doc) = self.load(address).await? {
                for record in doc.solutions {
                    index.insert(pair_key(address, &record.challenge_id));
                }
            }
        }
        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{MemStore, ManualClock};

    fn ledger() -> (SolutionsLedger, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (SolutionsLedger::new(store.clone(), clock), store)
    }

    #[tokio::test]
    async fn test_record_then_has_solution() {
        let (ledger, _) = ledger();

        assert!(!ledger.has_solution("a", "c1").await.unwrap());
        ledger.record("a", "c1", "42", Some("w1")).await.unwrap();
        assert!(ledger.has_solution("a", "c1").await.unwrap());
        assert!(!ledger.has_solution("a", "c2").await.unwrap());
    }

    #[tokio::test]
    async fn test_repeated_record_is_one_record() {
        let (ledger, _) = ledger();

        ledger.record("a", "c1", "42", Some("w1")).await.unwrap();
        ledger.record("a", "c1", "43", Some("w1")).await.unwrap();
        ledger.record("a", "c1", "44", None).await.unwrap();

        let doc = ledger.load("a").await.unwrap().unwrap();
        assert_eq!(doc.solutions.len(), 1);
        // the first record wins
        assert_eq!(doc.solutions[0].nonce, "42");
    }

    #[tokio::test]
    async fn test_records_of_different_challenges_accumulate() {
        let (ledger, _) = ledger();

        ledger.record("a", "c1", "1", None).await.unwrap();
        ledger.record("a", "c2", "2", None).await.unwrap();

        let doc = ledger.load("a").await.unwrap().unwrap();
        assert_eq!(doc.solutions.len(), 2);
    }

    #[tokio::test]
    async fn test_load_index_spans_addresses() {
        let (ledger, _) = ledger();

        ledger.record("a", "c1", "1", None).await.unwrap();
        ledger.record("b", "c2", "2", None).await.unwrap();

        let index = ledger
            .load_index(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.contains(&pair_key("a", "c1")));
        assert!(index.contains(&pair_key("b", "c2")));
    }
}
