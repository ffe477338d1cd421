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

//! In-memory capability fakes shared by the test modules of this crate and
//! by integration tests of backend crates

use crate::api;
use crate::challenges::QueuedChallenge;
use crate::error::{self, ErrorKind};
use crate::hal::{
    CasOutcome, Clock, ComputeProvider, DonationSource, MetadataProvider, MineApi, Object,
    ObjectMeta, ObjectStore, Precondition, Signature, Signer, WorkerInstance,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Deterministic address list `a0..a{n-1}`
pub fn addresses(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("a{}", i)).collect()
}

/// Challenge whose submission window closes `closes_in` from the clock's now
pub fn challenge_closing_in(
    challenge_id: &str,
    difficulty: &str,
    clock: &dyn Clock,
    closes_in: Duration,
) -> QueuedChallenge {
    let now = clock.now();
    QueuedChallenge {
        challenge_id: challenge_id.to_string(),
        challenge_number: 1,
        day: 1,
        difficulty: difficulty.to_string(),
        no_pre_mine: "00".repeat(32),
        no_pre_mine_hour: "0".to_string(),
        latest_submission: now + closes_in,
        available_at: Some(now),
    }
}

struct StoredObject {
    body: Vec<u8>,
    etag: String,
    metadata: HashMap<String, String>,
}

/// Object store with real compare-and-set semantics
pub struct MemStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    revision: AtomicU64,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            revision: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_etag(&self) -> String {
        format!("rev-{}", self.revision.fetch_add(1, Ordering::SeqCst))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredObject>> {
        self.objects.lock().expect("BUG: store mutex poisoned")
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &str) -> error::Result<Option<Object>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().get(key).map(|stored| Object {
            body: stored.body.clone(),
            etag: stored.etag.clone(),
        }))
    }

    async fn head(&self, key: &str) -> error::Result<Option<ObjectMeta>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().get(key).map(|stored| ObjectMeta {
            etag: stored.etag.clone(),
            metadata: stored.metadata.clone(),
        }))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> error::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let etag = self.next_etag();
        self.lock().insert(
            key.to_string(),
            StoredObject {
                body,
                etag,
                metadata: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn put_with_metadata(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> error::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let etag = self.next_etag();
        self.lock().insert(
            key.to_string(),
            StoredObject {
                body,
                etag,
                metadata,
            },
        );
        Ok(())
    }

    async fn put_conditional(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: Precondition,
    ) -> error::Result<CasOutcome> {
        let etag = self.next_etag();
        let mut objects = self.lock();
        let matches = match (&precondition, objects.get(key)) {
            (Precondition::IfMatch(expected), Some(stored)) => &stored.etag == expected,
            (Precondition::IfMatch(_), None) => false,
            (Precondition::IfAbsent, None) => true,
            (Precondition::IfAbsent, Some(_)) => false,
        };
        if !matches {
            return Ok(CasOutcome::PreconditionFailed);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                etag,
                metadata: HashMap::new(),
            },
        );
        Ok(CasOutcome::Committed)
    }

    async fn list(&self, prefix: &str) -> error::Result<Vec<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut keys: Vec<String> = self
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> error::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock().remove(key);
        Ok(())
    }
}

/// Manually driven clock for expiry and staleness tests
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("BUG: clock mutex poisoned");
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("BUG: clock mutex poisoned") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("BUG: clock mutex poisoned")
    }
}

/// Scripted Mine API
pub struct FakeApi {
    challenge: Mutex<Option<QueuedChallenge>>,
    challenge_fetch_fails: Mutex<bool>,
    submissions: Mutex<Vec<(String, String, String)>>,
    submit_outcome: Mutex<Option<api::Submit>>,
    registrations: Mutex<Vec<(String, String, String)>>,
    register_outcomes: Mutex<VecDeque<api::Register>>,
    donations: Mutex<Vec<(String, String, String)>>,
    rates: Mutex<Vec<f64>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            challenge: Mutex::new(None),
            challenge_fetch_fails: Mutex::new(false),
            submissions: Mutex::new(Vec::new()),
            submit_outcome: Mutex::new(None),
            registrations: Mutex::new(Vec::new()),
            register_outcomes: Mutex::new(VecDeque::new()),
            donations: Mutex::new(Vec::new()),
            rates: Mutex::new(vec![1.0]),
        }
    }

    pub fn set_challenge(&self, challenge: Option<QueuedChallenge>) {
        *self.challenge.lock().unwrap() = challenge;
    }

    pub fn fail_challenge_fetch(&self, fail: bool) {
        *self.challenge_fetch_fails.lock().unwrap() = fail;
    }

    /// Sticky override of the submission outcome; default is acceptance
    pub fn set_submit_outcome(&self, outcome: api::Submit) {
        *self.submit_outcome.lock().unwrap() = Some(outcome);
    }

    pub fn submissions(&self) -> Vec<(String, String, String)> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn set_register_outcomes(&self, outcomes: Vec<api::Register>) {
        *self.register_outcomes.lock().unwrap() = outcomes.into();
    }

    pub fn registrations(&self) -> Vec<(String, String, String)> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn set_rates(&self, rates: Vec<f64>) {
        *self.rates.lock().unwrap() = rates;
    }

    pub fn donations(&self) -> Vec<(String, String, String)> {
        self.donations.lock().unwrap().clone()
    }
}

#[async_trait]
impl MineApi for FakeApi {
    async fn fetch_challenge(&self) -> error::Result<api::ChallengeStatus> {
        if *self.challenge_fetch_fails.lock().unwrap() {
            return Err(ErrorKind::Api("scripted failure".to_string()))?;
        }
        Ok(match self.challenge.lock().unwrap().clone() {
            Some(queued) => api::ChallengeStatus::Active {
                challenge: api::Challenge {
                    challenge_id: queued.challenge_id,
                    challenge_number: queued.challenge_number,
                    day: queued.day,
                    issued_at: queued.available_at,
                    difficulty: queued.difficulty,
                    no_pre_mine: queued.no_pre_mine,
                    latest_submission: queued.latest_submission,
                    no_pre_mine_hour: queued.no_pre_mine_hour,
                },
                mining_period_ends: None,
                max_day: None,
                total_challenges: None,
                current_day: None,
                next_challenge_starts_at: None,
            },
            None => api::ChallengeStatus::Before {
                next_challenge_starts_at: None,
            },
        })
    }

    async fn submit_solution(&self, address: &str, challenge_id: &str, nonce: &str) -> api::Submit {
        self.submissions.lock().unwrap().push((
            address.to_string(),
            challenge_id.to_string(),
            nonce.to_string(),
        ));
        self.submit_outcome
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| api::Submit::Accepted(Default::default()))
    }

    async fn terms(&self, version: &str) -> error::Result<api::Terms> {
        Ok(api::Terms {
            version: version.to_string(),
            content: "terms and conditions".to_string(),
            message: "terms message".to_string(),
        })
    }

    async fn register(&self, address: &str, signature: &str, pubkey: &str) -> api::Register {
        self.registrations.lock().unwrap().push((
            address.to_string(),
            signature.to_string(),
            pubkey.to_string(),
        ));
        self.register_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| api::Register::Accepted(Default::default()))
    }

    async fn reward_rates(&self) -> error::Result<Vec<f64>> {
        Ok(self.rates.lock().unwrap().clone())
    }

    async fn donate_to(&self, destination: &str, original: &str, signature: &str) -> api::Donate {
        self.donations.lock().unwrap().push((
            destination.to_string(),
            original.to_string(),
            signature.to_string(),
        ));
        api::Donate::Accepted(Default::default())
    }
}

/// Compute provider with a fixed worker set
pub struct FakeCompute {
    workers: Mutex<Vec<String>>,
    launched: AtomicUsize,
}

impl FakeCompute {
    pub fn with_workers(ids: &[&str]) -> Self {
        Self {
            workers: Mutex::new(ids.iter().map(|id| id.to_string()).collect()),
            launched: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ComputeProvider for FakeCompute {
    async fn list_workers(&self) -> error::Result<Vec<WorkerInstance>> {
        Ok(self
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|id| WorkerInstance {
                id: id.clone(),
                public_endpoint: None,
                launched_at: None,
            })
            .collect())
    }

    async fn launch_workers(&self, count: usize) -> error::Result<Vec<String>> {
        let mut workers = self.workers.lock().unwrap();
        let mut ids = Vec::new();
        for _ in 0..count {
            let id = format!("launched-{}", self.launched.fetch_add(1, Ordering::SeqCst));
            workers.push(id.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    async fn set_desired_count(&self, count: usize) -> error::Result<()> {
        let current = self.workers.lock().unwrap().len();
        if count > current {
            self.launch_workers(count - current).await?;
        } else {
            let mut workers = self.workers.lock().unwrap();
            workers.truncate(count);
        }
        Ok(())
    }

    async fn terminate_workers(&self, ids: &[String]) -> error::Result<()> {
        self.workers
            .lock()
            .unwrap()
            .retain(|id| !ids.contains(id));
        Ok(())
    }
}

/// Fixed identity provider
pub struct FakeMetadata {
    pub worker_id: String,
    pub region: String,
    pub public_endpoint: Option<String>,
}

#[async_trait]
impl MetadataProvider for FakeMetadata {
    async fn worker_id(&self) -> error::Result<String> {
        Ok(self.worker_id.clone())
    }

    async fn region(&self) -> error::Result<String> {
        Ok(self.region.clone())
    }

    async fn public_endpoint(&self) -> error::Result<Option<String>> {
        Ok(self.public_endpoint.clone())
    }
}

/// Deterministic signer
pub struct FakeSigner;

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(&self, address: &str, message: &str) -> error::Result<Signature> {
        Ok(Signature {
            signature: format!("signed:{}:{}", address, message.len()),
            pubkey: format!("pub:{}", address),
        })
    }
}

/// Donation source that can be scripted away
pub struct FakeDonation {
    address: Mutex<Option<String>>,
}

impl FakeDonation {
    pub fn with_address(address: &str) -> Self {
        Self {
            address: Mutex::new(Some(address.to_string())),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            address: Mutex::new(None),
        }
    }

    pub fn set_address(&self, address: Option<String>) {
        *self.address.lock().unwrap() = address;
    }
}

#[async_trait]
impl DonationSource for FakeDonation {
    async fn fetch_address(&self) -> error::Result<String> {
        self.address
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ErrorKind::Api("donation endpoint unavailable".to_string()).into())
    }
}
