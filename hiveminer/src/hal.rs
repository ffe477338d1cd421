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

//! External capabilities consumed by the coordinator core. Each trait holds the
//! minimum surface the core needs; concrete providers are injected at
//! construction time which also pins the exact external contract for tests.

use crate::api;
use crate::error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use std::collections::HashMap;

/// Object fetched from the store together with its entity tag
#[derive(Debug, Clone)]
pub struct Object {
    pub body: Vec<u8>,
    pub etag: String,
}

/// Object metadata without the body
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub etag: String,
    pub metadata: HashMap<String, String>,
}

/// Outcome of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Committed,
    /// The object changed (or appeared) since the revision the write was based on
    PreconditionFailed,
}

/// Revision precondition of a conditional write
#[derive(Debug, Clone)]
pub enum Precondition {
    /// Replace exactly the revision carrying this entity tag
    IfMatch(String),
    /// Create the object only when it does not exist yet
    IfAbsent,
}

/// Shared object store with compare-and-set semantics on writes
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> error::Result<Option<Object>>;

    async fn head(&self, key: &str) -> error::Result<Option<ObjectMeta>>;

    /// Unconditional write; reserved for objects with a single logical writer
    async fn put(&self, key: &str, body: Vec<u8>) -> error::Result<()>;

    async fn put_with_metadata(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> error::Result<()>;

    async fn put_conditional(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: Precondition,
    ) -> error::Result<CasOutcome>;

    /// List object keys under a prefix
    async fn list(&self, prefix: &str) -> error::Result<Vec<String>>;

    async fn delete(&self, key: &str) -> error::Result<()>;
}

/// The proof-of-work challenge service
#[async_trait]
pub trait MineApi: Send + Sync {
    async fn fetch_challenge(&self) -> error::Result<api::ChallengeStatus>;

    async fn submit_solution(&self, address: &str, challenge_id: &str, nonce: &str) -> api::Submit;

    async fn terms(&self, version: &str) -> error::Result<api::Terms>;

    async fn register(&self, address: &str, signature: &str, pubkey: &str) -> api::Register;

    /// Daily reward-per-solution history; the last element is current
    async fn reward_rates(&self) -> error::Result<Vec<f64>>;

    async fn donate_to(&self, destination: &str, original: &str, signature: &str) -> api::Donate;
}

/// One live worker as reported by the compute control plane
#[derive(Debug, Clone)]
pub struct WorkerInstance {
    pub id: String,
    pub public_endpoint: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
}

/// Compute control plane; used for peer discovery and operator actions only
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn list_workers(&self) -> error::Result<Vec<WorkerInstance>>;

    async fn launch_workers(&self, count: usize) -> error::Result<Vec<String>>;

    async fn set_desired_count(&self, count: usize) -> error::Result<()>;

    async fn terminate_workers(&self, ids: &[String]) -> error::Result<()>;
}

/// Identity of the node the process runs on
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn worker_id(&self) -> error::Result<String>;

    async fn region(&self) -> error::Result<String>;

    async fn public_endpoint(&self) -> error::Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub signature: String,
    pub pubkey: String,
}

/// Message signing with an address key; backed by an external signing tool
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, address: &str, message: &str) -> error::Result<Signature>;
}

/// Source of donation addresses; may be unavailable
#[async_trait]
pub trait DonationSource: Send + Sync {
    async fn fetch_address(&self) -> error::Result<String>;
}

/// Injected clock so that expiry decisions are testable
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock reading system time
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
