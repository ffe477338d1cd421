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

//! Mine API wire model and enumerated call outcomes

pub mod client;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Challenge description as served by the Mine API
#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    pub challenge_id: String,
    pub challenge_number: u64,
    pub day: u32,
    pub issued_at: Option<DateTime<Utc>>,
    /// Hex mask; a hash qualifies iff all its set bits are set here as well
    pub difficulty: String,
    /// 64 hex characters mixed into the preimage to prevent pre-mining
    pub no_pre_mine: String,
    pub latest_submission: DateTime<Utc>,
    pub no_pre_mine_hour: String,
}

/// `GET /challenge` response, keyed by the `code` field
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "code", rename_all = "lowercase")]
pub enum ChallengeStatus {
    Active {
        challenge: Challenge,
        mining_period_ends: Option<DateTime<Utc>>,
        max_day: Option<u32>,
        total_challenges: Option<u64>,
        current_day: Option<u32>,
        next_challenge_starts_at: Option<DateTime<Utc>>,
    },
    Before {
        next_challenge_starts_at: Option<DateTime<Utc>>,
    },
    After {
        mining_period_ends: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SolutionReceipt {
    pub address: Option<String>,
    pub challenge_id: Option<String>,
    pub nonce: Option<String>,
    pub crypto_receipt: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Terms {
    pub version: String,
    pub content: String,
    /// Must be signed verbatim by an address before registration
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationReceipt {
    pub address: Option<String>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DonationReceipt {
    pub destination: Option<String>,
    pub original: Option<String>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
}

/// Outcome of a solution submission. Duplicates and transient failures are
/// ordinary outcomes here, not errors; the Mine API resolves fleet-wide
/// duplicates on its own.
#[derive(Debug, Clone)]
pub enum Submit {
    Accepted(SolutionReceipt),
    /// The (address, challenge) pair has already been submitted
    Duplicate,
    Transient(String),
    Fatal(String),
}

/// Outcome of an address registration
#[derive(Debug, Clone)]
pub enum Register {
    Accepted(RegistrationReceipt),
    Duplicate,
    Transient(String),
    Fatal(String),
}

/// Outcome of a donation transfer
#[derive(Debug, Clone)]
pub enum Donate {
    Accepted(DonationReceipt),
    /// The donation window has not opened yet
    WindowClosed,
    Duplicate,
    Transient(String),
    Fatal(String),
}
