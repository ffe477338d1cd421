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

//! Bounded exponential backoff used by conditional-write loops and HTTP retries

use rand::Rng;
use std::time::Duration;

/// Base delay of registry conditional-write retries
pub const REGISTRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Delay cap of registry conditional-write retries
pub const REGISTRY_BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Backoff tuned for the registry conditional-write discipline
    pub fn registry() -> Self {
        Self::new(REGISTRY_BACKOFF_BASE, REGISTRY_BACKOFF_CAP)
    }

    /// Next delay in the doubling sequence, saturated at the cap
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::max_value());
        self.attempt = self.attempt.saturating_add(1);
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }
}

/// Uniformly random delay within `[0, limit]`
pub fn jitter(limit: Duration) -> Duration {
    let millis = limit.as_millis() as u64;
    if millis == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
