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

//! Work queue construction. A work item is one (address, challenge) pair;
//! the queue is the cross product of local addresses and open challenges
//! minus everything the solutions ledger already contains.

use crate::challenges::QueuedChallenge;
use crate::solutions::pair_key;

use std::collections::HashSet;

/// One donation item is woven in after this many regular items
pub const DONATION_SPACING: usize = 20;

/// Unit of mining dispatch
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub address: String,
    pub challenge: QueuedChallenge,
    /// Donation items are counted in stats but never written into
    /// per-address solution files
    pub donation: bool,
}

impl WorkItem {
    pub fn new(address: String, challenge: QueuedChallenge) -> Self {
        Self {
            address,
            challenge,
            donation: false,
        }
    }

    pub fn donation(address: String, challenge: QueuedChallenge) -> Self {
        Self {
            address,
            challenge,
            donation: true,
        }
    }

    /// Dedup and in-progress key of this item
    #[inline]
    pub fn key(&self) -> String {
        pair_key(&self.address, &self.challenge.challenge_id)
    }
}

/// Number of set bits in a hex difficulty mask. One more set bit roughly
/// doubles the valid-hash density, so this single scalar orders challenges
/// from easy to hard.
pub fn difficulty_bits(difficulty: &str) -> u32 {
    difficulty
        .trim_start_matches("0x")
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(|digit| digit.count_ones())
        .sum()
}

/// Base-2 logarithm of the expected hash attempts per solution. One more set
/// bit in the mask halves the work, which is what makes popcount the sole
/// scalar determinant of difficulty.
pub fn attempts_log2(difficulty: &str) -> u32 {
    256u32.saturating_sub(difficulty_bits(difficulty))
}

/// A hash satisfies a difficulty mask iff every bit set in the hash is also
/// set in the mask (`H | D == D`). Digits are compared from the least
/// significant end; where one operand is shorter it is zero-extended.
pub fn hash_meets_difficulty(hash: &str, difficulty: &str) -> bool {
    let hash_digits: Vec<u32> = hash
        .trim_start_matches("0x")
        .chars()
        .filter_map(|c| c.to_digit(16))
        .collect();
    let mask_digits: Vec<u32> = difficulty
        .trim_start_matches("0x")
        .chars()
        .filter_map(|c| c.to_digit(16))
        .collect();

    let mut hash_iter = hash_digits.iter().rev();
    let mut mask_iter = mask_digits.iter().rev();
    loop {
        match (hash_iter.next(), mask_iter.next()) {
            (None, None) => return true,
            (hash_digit, mask_digit) => {
                let hash_digit = hash_digit.copied().unwrap_or(0);
                let mask_digit = mask_digit.copied().unwrap_or(0);
                if hash_digit | mask_digit != mask_digit {
                    return false;
                }
            }
        }
    }
}

/// Build the dispatch queue: easiest challenge first, every address of a
/// challenge before the next challenge, already solved pairs skipped. When a
/// donation address is supplied a donation item against the easiest challenge
/// is inserted after every [`DONATION_SPACING`] regular items.
pub fn build(
    addresses: &[String],
    challenges: &[QueuedChallenge],
    solved: &HashSet<String>,
    donation_address: Option<&str>,
) -> Vec<WorkItem> {
    let mut ordered: Vec<&QueuedChallenge> = challenges.iter().collect();
    ordered.sort_by(|a, b| difficulty_bits(&b.difficulty).cmp(&difficulty_bits(&a.difficulty)));

    let easiest = ordered.first().map(|challenge| (*challenge).clone());

    let mut queue = Vec::new();
    let mut since_donation = 0;
    for challenge in ordered {
        for address in addresses {
            if solved.contains(&pair_key(address, &challenge.challenge_id)) {
                continue;
            }
            queue.push(WorkItem::new(address.clone(), challenge.clone()));
            since_donation += 1;

            if since_donation == DONATION_SPACING {
                since_donation = 0;
                if let (Some(donation_address), Some(easiest)) =
                    (donation_address, easiest.as_ref())
                {
                    queue.push(WorkItem::donation(
                        donation_address.to_string(),
                        easiest.clone(),
                    ));
                }
            }
        }
    }
    queue
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{challenge_closing_in, ManualClock};

    use chrono::{Duration, Utc};

    fn challenge(id: &str, difficulty: &str) -> QueuedChallenge {
        let clock = ManualClock::new(Utc::now());
        challenge_closing_in(id, difficulty, &clock, Duration::hours(1))
    }

    #[test]
    fn test_difficulty_bits_counts_set_bits() {
        assert_eq!(difficulty_bits("000007FF"), 11);
        assert_eq!(difficulty_bits("0000000F"), 4);
        assert_eq!(difficulty_bits("0"), 0);
        assert_eq!(difficulty_bits("0xff"), 8);
        // stray non-hex characters are ignored rather than fatal
        assert_eq!(difficulty_bits("0f-0f"), 8);
    }

    #[test]
    fn test_attempts_shrink_with_more_set_bits() {
        assert_eq!(attempts_log2("000007FF"), 245);
        assert_eq!(attempts_log2("0000000F"), 252);
        assert!(attempts_log2("000007FF") < attempts_log2("0000000F"));
    }

    #[test]
    fn test_hash_meets_difficulty_is_subset_mask() {
        assert!(hash_meets_difficulty("00000003", "000007FF"));
        assert!(hash_meets_difficulty("07ff", "000007FF"));
        assert!(!hash_meets_difficulty("00000800", "000007FF"));
        // equal masks trivially qualify
        assert!(hash_meets_difficulty("000007FF", "000007FF"));
        // a longer hash qualifies only with zero high digits
        assert!(hash_meets_difficulty("000000000000000f", "0f"));
        assert!(!hash_meets_difficulty("100000000000000f", "0f"));
    }

    #[test]
    fn test_build_orders_easiest_challenge_first() {
        // scenario S3: 11 set bits beat 4 set bits
        let challenges = vec![challenge("c2", "0000000F"), challenge("c1", "000007FF")];
        let addresses = vec!["a".to_string()];

        let queue = build(&addresses, &challenges, &HashSet::new(), None);
        let ids: Vec<&str> = queue
            .iter()
            .map(|item| item.challenge.challenge_id.as_str())
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_build_skips_solved_pairs() {
        // scenario S4: (a, c1) is already in the ledger
        let challenges = vec![challenge("c1", "ff"), challenge("c2", "0f")];
        let addresses = vec!["a".to_string()];
        let mut solved = HashSet::new();
        solved.insert(pair_key("a", "c1"));

        let queue = build(&addresses, &challenges, &solved, None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].address, "a");
        assert_eq!(queue[0].challenge.challenge_id, "c2");
    }

    #[test]
    fn test_build_crosses_addresses_and_challenges() {
        let challenges = vec![challenge("c1", "ff"), challenge("c2", "0f")];
        let addresses = vec!["a".to_string(), "b".to_string()];

        let queue = build(&addresses, &challenges, &HashSet::new(), None);
        let keys: Vec<String> = queue.iter().map(|item| item.key()).collect();
        assert_eq!(keys, vec!["a-c1", "b-c1", "a-c2", "b-c2"]);
    }

    #[test]
    fn test_donation_item_every_spacing_items() {
        let challenges = vec![challenge("hard", "03"), challenge("easy", "ff")];
        let addresses: Vec<String> = (0..DONATION_SPACING * 2)
            .map(|i| format!("a{}", i))
            .collect();

        let queue = build(&addresses, &challenges, &HashSet::new(), Some("donate"));

        let donations: Vec<usize> = queue
            .iter()
            .enumerate()
            .filter(|(_, item)| item.donation)
            .map(|(i, _)| i)
            .collect();
        // 80 regular items produce a donation after every 20th
        assert_eq!(donations, vec![20, 41, 62, 83]);
        for (_, item) in queue.iter().enumerate().filter(|(_, item)| item.donation) {
            assert_eq!(item.address, "donate");
            // donations always mine the easiest challenge
            assert_eq!(item.challenge.challenge_id, "easy");
        }
    }

    #[test]
    fn test_no_donation_items_without_address() {
        let challenges = vec![challenge("c1", "ff")];
        let addresses: Vec<String> = (0..DONATION_SPACING * 2)
            .map(|i| format!("a{}", i))
            .collect();

        let queue = build(&addresses, &challenges, &HashSet::new(), None);
        assert!(queue.iter().all(|item| !item.donation));
        assert_eq!(queue.len(), DONATION_SPACING * 2);
    }
}
