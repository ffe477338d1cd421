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

//! Per-worker liveness files. Each file has exactly one writer so plain
//! overwrites are safe; the reclaimer only ever reads and deletes them.

use hiveminer_logging::macros::*;

use crate::error;
use crate::hal::{Clock, ObjectStore};
use crate::halt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const HEARTBEAT_PREFIX: &str = "heartbeats/";

pub fn heartbeat_key(worker_id: &str) -> String {
    format!("{}{}.json", HEARTBEAT_PREFIX, worker_id)
}

fn worker_id_of_key(key: &str) -> Option<&str> {
    key.strip_prefix(HEARTBEAT_PREFIX)?.strip_suffix(".json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_endpoint: Option<String>,
}

/// Access to the liveness files of the whole fleet
#[derive(Clone)]
pub struct Heartbeats {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl Heartbeats {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Refresh this worker's liveness file
    pub async fn beat(
        &self,
        worker_id: &str,
        public_endpoint: Option<String>,
    ) -> error::Result<()> {
        let heartbeat = Heartbeat {
            last_heartbeat: self.clock.now(),
            public_endpoint,
        };
        self.store
            .put(
                &heartbeat_key(worker_id),
                serde_json::to_vec(&heartbeat)?,
            )
            .await
    }

    /// Map every worker with a liveness file to its last beat
    pub async fn collect(&self) -> error::Result<HashMap<String, Heartbeat>> {
        let mut beats = HashMap::new();
        for key in self.store.list(HEARTBEAT_PREFIX).await? {
            let worker_id = match worker_id_of_key(&key) {
                Some(worker_id) => worker_id.to_string(),
                None => continue,
            };
            if let Some(object) = self.store.get(&key).await? {
                match serde_json::from_slice::<Heartbeat>(&object.body) {
                    Ok(heartbeat) => {
                        beats.insert(worker_id, heartbeat);
                    }
                    Err(e) => warn!("Heartbeat: unreadable file {}: {}", key, e),
                }
            }
        }
        Ok(beats)
    }

    pub async fn remove(&self, worker_id: &str) -> error::Result<()> {
        self.store.delete(&heartbeat_key(worker_id)).await
    }

    /// Periodic beat task of one worker; failures are logged and retried on
    /// the next interval because a missed beat only ages the worker
    pub async fn run(
        self,
        worker_id: String,
        public_endpoint: Option<String>,
        interval: Duration,
        mut halt_receiver: halt::Receiver,
    ) {
        loop {
            if let Err(e) = self.beat(&worker_id, public_endpoint.clone()).await {
                warn!("Heartbeat: write failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = halt_receiver.wait_for_halt() => {
                    info!("Heartbeat: task stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{MemStore, ManualClock};

    #[tokio::test]
    async fn test_beat_collect_remove_cycle() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let heartbeats = Heartbeats::new(store.clone(), clock.clone());

        heartbeats.beat("w1", Some("w1.example".to_string())).await.unwrap();
        heartbeats.beat("w2", None).await.unwrap();

        let beats = heartbeats.collect().await.unwrap();
        assert_eq!(beats.len(), 2);
        assert_eq!(
            beats["w1"].public_endpoint.as_deref(),
            Some("w1.example")
        );

        heartbeats.remove("w1").await.unwrap();
        let beats = heartbeats.collect().await.unwrap();
        assert!(!beats.contains_key("w1"));
        assert!(beats.contains_key("w2"));
    }

    #[tokio::test]
    async fn test_beat_overwrites_previous_timestamp() {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let heartbeats = Heartbeats::new(store.clone(), clock.clone());

        heartbeats.beat("w1", None).await.unwrap();
        let first = heartbeats.collect().await.unwrap()["w1"].last_heartbeat;

        clock.advance(chrono::Duration::seconds(60));
        heartbeats.beat("w1", None).await.unwrap();
        let second = heartbeats.collect().await.unwrap()["w1"].last_heartbeat;

        assert!(second > first);
    }
}
