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

//! Top level orchestrator of one worker: wires the ledgers, the challenge
//! puller, the dispatch pool, the heartbeat and the reclaimer together and
//! runs the mining loop until halted.

use hiveminer_logging::macros::*;

use crate::challenges::{ChallengeLedger, Puller};
use crate::dispatch::Pool;
use crate::hal::{Clock, ComputeProvider, DonationSource, MineApi, ObjectStore};
use crate::halt;
use crate::heartbeat::Heartbeats;
use crate::miner::{MineOutcome, Miner};
use crate::reclaimer::Reclaimer;
use crate::registry::RegistryStore;
use crate::solutions::SolutionsLedger;
use crate::stats::StatsLedger;
use crate::submit::{Disposition, Submitter};
use crate::work;

use hiveminer_config::Configuration;

use futures::lock::Mutex;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// How long running subprocesses get to wind down on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Externally injected capabilities of one worker
pub struct Capabilities {
    pub store: Arc<dyn ObjectStore>,
    pub api: Arc<dyn MineApi>,
    pub compute: Arc<dyn ComputeProvider>,
    pub clock: Arc<dyn Clock>,
    pub donation: Option<Arc<dyn DonationSource>>,
}

/// Concentrates handles to all subsystems associated with mining
pub struct Core {
    config: Configuration,
    worker_id: String,
    public_endpoint: Option<String>,
    addresses: Vec<String>,
    clock: Arc<dyn Clock>,
    donation: Option<Arc<dyn DonationSource>>,
    challenges: ChallengeLedger,
    solutions: SolutionsLedger,
    heartbeats: Heartbeats,
    pool: Pool,
    miner: Miner,
    submitter: Submitter,
    /// (address, challenge) pairs already submitted; grown on acceptance
    solved: Mutex<HashSet<String>>,
    puller: Mutex<Option<Puller>>,
    reclaimer: Mutex<Option<Reclaimer>>,
}

impl Core {
    pub fn new(
        config: Configuration,
        region: String,
        worker_id: String,
        public_endpoint: Option<String>,
        addresses: Vec<String>,
        capabilities: Capabilities,
    ) -> Self {
        let Capabilities {
            store,
            api,
            compute,
            clock,
            donation,
        } = capabilities;

        let challenges = ChallengeLedger::new(store.clone(), clock.clone(), region);
        let heartbeats = Heartbeats::new(store.clone(), clock.clone());
        let solutions = SolutionsLedger::new(store.clone(), clock.clone());
        let stats = StatsLedger::new(store.clone(), clock.clone());
        let registry = RegistryStore::new(store, clock.clone());

        let puller = Puller::new(api.clone(), challenges.clone());
        let reclaimer = Reclaimer::new(
            registry,
            heartbeats.clone(),
            compute,
            clock.clone(),
            worker_id.clone(),
            config.reclaimer_stale(),
            config.reclaim_interval(),
        );
        let submitter = Submitter::new(
            api,
            solutions.clone(),
            stats,
            clock.clone(),
            worker_id.clone(),
        );

        Self {
            pool: Pool::new(config.worker_count()),
            miner: Miner::new(config.mining.miner_binary.clone()),
            config,
            worker_id,
            public_endpoint,
            addresses,
            clock,
            donation,
            challenges,
            solutions,
            heartbeats,
            submitter,
            solved: Mutex::new(HashSet::new()),
            puller: Mutex::new(Some(puller)),
            reclaimer: Mutex::new(Some(reclaimer)),
        }
    }

    #[inline]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until halted, then wind down the subprocess pool
    pub async fn run(self: Arc<Self>, mut halt_receiver: halt::Receiver) {
        info!(
            "Hub: worker {} mining {} addresses with {} subprocess slots",
            self.worker_id,
            self.addresses.len(),
            self.pool.capacity()
        );

        self.seed_solved_set().await;

        let puller = self
            .puller
            .lock()
            .await
            .take()
            .expect("BUG: missing challenge puller");
        tokio::spawn(puller.run(
            self.config.challenge_fetch_interval(),
            halt_receiver.clone(),
        ));

        let reclaimer = self
            .reclaimer
            .lock()
            .await
            .take()
            .expect("BUG: missing reclaimer");
        tokio::spawn(reclaimer.run(halt_receiver.clone()));

        tokio::spawn(self.heartbeats.clone().run(
            self.worker_id.clone(),
            self.public_endpoint.clone(),
            self.config.heartbeat_interval(),
            halt_receiver.clone(),
        ));

        // expiry scan keeps in-flight work inside submission windows
        {
            let core = self.clone();
            let interval = self.config.expiry_scan_interval();
            halt_receiver.spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    core.pool.abort_expired(core.clock.now()).await;
                }
            });
        }

        loop {
            self.clone().tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.work_check_interval()) => {}
                _ = halt_receiver.wait_for_halt() => break,
            }
        }

        self.shutdown().await;
    }

    /// Prime the dedup set from the durable ledger so a restarted worker does
    /// not re-mine its own history
    async fn seed_solved_set(&self) {
        match self.solutions.load_index(&self.addresses).await {
            Ok(index) => {
                info!("Hub: {} solved pairs loaded from the ledger", index.len());
                *self.solved.lock().await = index;
            }
            Err(e) => warn!("Hub: solved history not loaded: {}", e),
        }
    }

    /// One pass of the mining loop: rebuild the queue and top up the pool
    pub async fn tick(self: Arc<Self>) {
        let challenges = match self.challenges.open_challenges().await {
            Ok(challenges) => challenges,
            Err(e) => {
                warn!("Hub: challenge cache unavailable: {}", e);
                return;
            }
        };
        if challenges.is_empty() {
            debug!("Hub: no open challenges");
            return;
        }

        let donation_address = match &self.donation {
            Some(source) => match source.fetch_address().await {
                Ok(address) => Some(address),
                Err(e) => {
                    debug!("Hub: donation source unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        let solved = self.solved.lock().await.clone();
        let queue = work::build(
            &self.addresses,
            &challenges,
            &solved,
            donation_address.as_deref(),
        );

        for item in queue {
            if self.pool.len().await >= self.pool.capacity() {
                break;
            }
            if let Some(abort_receiver) = self.pool.try_claim(&item).await {
                let core = self.clone();
                tokio::spawn(async move { core.mine_one(item, abort_receiver).await });
            }
        }
    }

    async fn mine_one(self: Arc<Self>, item: work::WorkItem, mut abort_receiver: halt::Receiver) {
        let key = item.key();
        match self.miner.mine(&item, &mut abort_receiver).await {
            Ok(MineOutcome::Solved(output)) => {
                let nonce = output.nonce.expect("BUG: solved pass without nonce");
                match self.submitter.submit(&item, &nonce).await {
                    Disposition::Recorded => {
                        if !item.donation {
                            self.solved.lock().await.insert(key.clone());
                        }
                    }
                    // released below; a failed item is retried on a later tick
                    Disposition::Expired | Disposition::Failed => {}
                }
            }
            Ok(MineOutcome::Unsolved(message)) => {
                debug!(
                    "Hub: no solution for {} this pass ({:?})",
                    key, message
                );
            }
            Ok(MineOutcome::Aborted) => {
                debug!("Hub: pass for {} aborted", key);
            }
            Ok(MineOutcome::Crashed(reason)) => {
                warn!("Hub: miner crashed on {}: {}", key, reason);
            }
            Err(e) => {
                warn!("Hub: miner pass for {} failed: {}", key, e);
            }
        }
        self.pool.release(&key).await;
    }

    /// Stop accepting work and give subprocesses a bounded wind-down
    async fn shutdown(&self) {
        info!("Hub: shutting down, aborting in-flight work");
        self.pool.abort_all().await;

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.pool.is_idle().await {
            if tokio::time::Instant::now() >= deadline {
                warn!("Hub: shutdown grace expired with work still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("Hub: stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::solutions::pair_key;
    use crate::test_utils::{
        addresses, challenge_closing_in, FakeApi, FakeCompute, FakeDonation, MemStore, ManualClock,
    };

    use chrono::{Duration as ChronoDuration, Utc};
    use hiveminer_config::{ApiConfig, MiningConfig};

    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script_binary(dir: &tempfile::TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("miner.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", script).unwrap();
        let mut permissions = file.metadata().unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path
    }

    fn config(dir: &tempfile::TempDir, miner_binary: PathBuf, workers: usize) -> Configuration {
        Configuration {
            region: Some("eu-test-1".to_string()),
            bucket_prefix: "hiveminer".to_string(),
            api: ApiConfig {
                base_url: "http://mine.invalid".to_string(),
                donation_url: None,
                terms_version: None,
                timeout_secs: 5,
            },
            mining: MiningConfig {
                workers: Some(workers),
                addresses_per_instance: 5,
                miner_binary: miner_binary.clone(),
                signer_binary: miner_binary,
                cache_dir: dir.path().to_path_buf(),
            },
            intervals: Default::default(),
            thresholds: Default::default(),
            fleet: Default::default(),
        }
    }

    struct Fixture {
        core: Arc<Core>,
        store: Arc<MemStore>,
        clock: Arc<ManualClock>,
        api: Arc<FakeApi>,
        challenges: ChallengeLedger,
        solutions: SolutionsLedger,
        _dir: tempfile::TempDir,
    }

    fn fixture(script: &str, workers: usize, donation: Option<Arc<FakeDonation>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let miner_binary = script_binary(&dir, script);

        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let api = Arc::new(FakeApi::new());
        let challenges =
            ChallengeLedger::new(store.clone(), clock.clone(), "eu-test-1".to_string());
        let solutions = SolutionsLedger::new(store.clone(), clock.clone());

        let core = Core::new(
            config(&dir, miner_binary, workers),
            "eu-test-1".to_string(),
            "w1".to_string(),
            None,
            addresses(2),
            Capabilities {
                store: store.clone(),
                api: api.clone(),
                compute: Arc::new(FakeCompute::with_workers(&["w1"])),
                clock: clock.clone(),
                donation: donation.map(|source| source as Arc<dyn DonationSource>),
            },
        );

        Fixture {
            core: Arc::new(core),
            store,
            clock,
            api,
            challenges,
            solutions,
            _dir: dir,
        }
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_tick_mines_and_records_every_pair() {
        let f = fixture(
            r#"echo '{"success": true, "nonce": "7"}'"#,
            4,
            None,
        );
        f.challenges
            .upsert(challenge_closing_in(
                "c1",
                "ff",
                f.clock.as_ref(),
                ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        f.core.clone().tick().await;
        let solutions = f.solutions.clone();
        wait_until(|| {
            let solutions = solutions.clone();
            async move {
                solutions.has_solution("a0", "c1").await.unwrap()
                    && solutions.has_solution("a1", "c1").await.unwrap()
            }
        })
        .await;

        wait_until(|| {
            let core = f.core.clone();
            async move { core.pool.is_idle().await }
        })
        .await;

        // a later tick finds everything solved and submits nothing new
        let submissions_before = f.api.submissions().len();
        f.core.clone().tick().await;
        wait_until(|| {
            let core = f.core.clone();
            async move { core.pool.is_idle().await }
        })
        .await;
        assert_eq!(f.api.submissions().len(), submissions_before);
    }

    #[tokio::test]
    async fn test_tick_skips_closed_challenges() {
        let f = fixture(r#"echo '{"success": true, "nonce": "7"}'"#, 4, None);
        f.challenges
            .upsert(challenge_closing_in(
                "c1",
                "ff",
                f.clock.as_ref(),
                ChronoDuration::minutes(1),
            ))
            .await
            .unwrap();

        f.clock.advance(ChronoDuration::minutes(2));
        f.core.clone().tick().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(f.api.submissions().is_empty());
        assert!(f.core.pool.is_idle().await);
    }

    #[tokio::test]
    async fn test_unsolved_pass_leaves_item_for_retry() {
        let f = fixture(r#"echo '{"success": false}'"#, 4, None);
        f.challenges
            .upsert(challenge_closing_in(
                "c1",
                "ff",
                f.clock.as_ref(),
                ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        f.core.clone().tick().await;
        wait_until(|| {
            let core = f.core.clone();
            async move { core.pool.is_idle().await }
        })
        .await;

        assert!(f.api.submissions().is_empty());
        assert!(!f.solutions.has_solution("a0", "c1").await.unwrap());
        // nothing marked solved, so the next tick re-dispatches
        assert!(f.core.solved.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_solved_history_survives_restart() {
        let f = fixture(r#"echo '{"success": true, "nonce": "7"}'"#, 4, None);
        f.solutions.record("a0", "c1", "1", None).await.unwrap();

        f.core.seed_solved_set().await;
        assert!(f
            .core
            .solved
            .lock()
            .await
            .contains(&pair_key("a0", "c1")));

        f.challenges
            .upsert(challenge_closing_in(
                "c1",
                "ff",
                f.clock.as_ref(),
                ChronoDuration::hours(1),
            ))
            .await
            .unwrap();
        f.core.clone().tick().await;
        wait_until(|| {
            let core = f.core.clone();
            async move { core.pool.is_idle().await }
        })
        .await;

        // only the unsolved address was submitted
        let submitted: Vec<String> = f
            .api
            .submissions()
            .iter()
            .map(|(address, _, _)| address.clone())
            .collect();
        assert_eq!(submitted, vec!["a1".to_string()]);
        let _ = &f.store;
    }
}
