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

//! Worker-side address allocation. A local cache file makes restarts O(1);
//! the registry is only touched when the cache is missing or belongs to a
//! different worker identity.

use hiveminer_logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::registry::{Mutation, RegistryStore, ALLOCATOR_CAS_ATTEMPTS};

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// How many times to poll for a registry the controller may still be seeding
pub const REGISTRY_WAIT_ATTEMPTS: u32 = 10;

/// Delay between registry polls on a cold fleet
pub const REGISTRY_WAIT_DELAY: Duration = Duration::from_secs(5);

/// Local assignment cache, owned by exactly one worker identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedAssignment {
    worker_id: String,
    addresses: Vec<String>,
}

pub struct Allocator {
    registry: RegistryStore,
    cache_path: PathBuf,
    worker_id: String,
    public_endpoint: Option<String>,
    /// Tight staleness bound; the boot path reclaims aggressively because the
    /// caller is waiting for a slot
    stale_after: ChronoDuration,
}

impl Allocator {
    pub fn new(
        registry: RegistryStore,
        cache_path: PathBuf,
        worker_id: String,
        public_endpoint: Option<String>,
        stale_after: Duration,
    ) -> Self {
        Self {
            registry,
            cache_path,
            worker_id,
            public_endpoint,
            stale_after: ChronoDuration::from_std(stale_after)
                .expect("BUG: stale threshold out of range"),
        }
    }

    /// Produce the address slice this worker will mine
    pub async fn allocate(&self) -> error::Result<Vec<String>> {
        if let Some(cached) = self.read_cache() {
            info!(
                "Allocator: using {} cached addresses for {}",
                cached.len(),
                self.worker_id
            );
            return Ok(cached);
        }

        self.wait_for_registry().await?;
        let addresses = self.reserve().await?;
        self.write_cache(&addresses)?;
        info!(
            "Allocator: reserved {} addresses for {}",
            addresses.len(),
            self.worker_id
        );
        Ok(addresses)
    }

    /// Cache hit requires a matching worker identity; an image cloned from
    /// another instance must not inherit its slice.
    fn read_cache(&self) -> Option<Vec<String>> {
        let raw = fs::read(&self.cache_path).ok()?;
        match serde_json::from_slice::<CachedAssignment>(&raw) {
            Ok(cached) if cached.worker_id == self.worker_id => Some(cached.addresses),
            Ok(cached) => {
                warn!(
                    "Allocator: cache belongs to {}, ignoring it",
                    cached.worker_id
                );
                None
            }
            Err(e) => {
                warn!("Allocator: unreadable cache file: {}", e);
                None
            }
        }
    }

    fn write_cache(&self, addresses: &[String]) -> error::Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let cached = CachedAssignment {
            worker_id: self.worker_id.clone(),
            addresses: addresses.to_vec(),
        };
        fs::write(&self.cache_path, serde_json::to_vec_pretty(&cached)?)?;
        Ok(())
    }

    /// The controller may still be seeding a cold fleet; poll before failing
    async fn wait_for_registry(&self) -> error::Result<()> {
        for attempt in 0..REGISTRY_WAIT_ATTEMPTS {
            if self.registry.load().await?.is_some() {
                return Ok(());
            }
            info!(
                "Allocator: registry not seeded yet (attempt {}/{})",
                attempt + 1,
                REGISTRY_WAIT_ATTEMPTS
            );
            tokio::time::sleep(REGISTRY_WAIT_DELAY).await;
        }
        Err(ErrorKind::RegistryMissing)?
    }

    async fn reserve(&self) -> error::Result<Vec<String>> {
        let worker_id = self.worker_id.clone();
        let public_endpoint = self.public_endpoint.clone();
        let stale_after = self.stale_after;
        let clock_now = {
            let registry = self.registry.clone();
            move || registry.clock().now()
        };

        self.registry
            .update(ALLOCATOR_CAS_ATTEMPTS, move |registry| {
                let now = clock_now();

                if let Some(existing) = registry.assignments.get(&worker_id) {
                    return Ok(Mutation::Unchanged(existing.addresses.clone()));
                }

                // opportunistic reclaim on the critical boot path
                let reclaimed = registry.reclaim_stale(now, stale_after);
                if !reclaimed.is_empty() {
                    info!(
                        "Allocator: dropped stale assignments of {:?} while reserving",
                        reclaimed
                    );
                }

                registry
                    .reserve(&worker_id, public_endpoint.clone(), now)
                    .map(Mutation::Changed)
            })
            .await
    }
}
